//! Thin CLI controller around the `netgovern` engine.
//!
//! Stands in for whatever real controller (tray app, daemon manager, web
//! UI) would drive the engine in production; enough surface here to start
//! it, set rules, and inspect state from a terminal.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use netgovern::{Engine, GlobalRule, ProcessRule};

#[derive(Parser)]
#[command(name = "netgovernd", about = "Per-process network bandwidth governor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine and block, printing throughput every second until
    /// interrupted (Ctrl+C).
    Run,
    /// Set (or clear) the bandwidth rule for a single PID.
    SetRule {
        pid: u32,
        #[arg(long)]
        block: bool,
        #[arg(long)]
        download_kbps: Option<u32>,
        #[arg(long)]
        upload_kbps: Option<u32>,
        #[arg(long)]
        adaptive: bool,
    },
    /// Set (or clear) the process-wide global rule.
    SetGlobalRule {
        #[arg(long)]
        block: bool,
        #[arg(long)]
        download_kbps: Option<u32>,
        #[arg(long)]
        upload_kbps: Option<u32>,
        #[arg(long)]
        adaptive: bool,
    },
    /// Print every configured rule and the processes currently visible.
    ShowRules,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netgovern=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let engine = Engine::new();

    let result = match cli.command {
        Command::Run => run_and_block(&engine),
        Command::SetRule { pid, block, download_kbps, upload_kbps, adaptive } => {
            engine.set_rule(pid, build_rule(block, download_kbps, upload_kbps, adaptive));
            println!("{}", serde_json::to_string_pretty(&engine.get_rule(pid)).unwrap());
            Ok(())
        }
        Command::SetGlobalRule { block, download_kbps, upload_kbps, adaptive } => {
            let rule: GlobalRule = build_rule(block, download_kbps, upload_kbps, adaptive);
            engine.set_global_rule(rule);
            println!("{}", serde_json::to_string_pretty(&engine.get_global_rule()).unwrap());
            Ok(())
        }
        Command::ShowRules => {
            for proc in engine.list_network_processes() {
                println!("{}", serde_json::to_string(&proc).unwrap());
            }
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code().clamp(1, 255) as u8)
        }
    }
}

fn build_rule(block: bool, download_kbps: Option<u32>, upload_kbps: Option<u32>, adaptive: bool) -> ProcessRule {
    ProcessRule {
        block_all: block,
        limit_download: download_kbps.is_some(),
        download_kbps: download_kbps.unwrap_or(0),
        limit_upload: upload_kbps.is_some(),
        upload_kbps: upload_kbps.unwrap_or(0),
        adaptive,
        adjusted_dl_rate: 0.0,
        adjusted_ul_rate: 0.0,
    }
}

/// Start the engine and print periodic throughput until the process is
/// killed. There is no in-process stop trigger here — the engine's `Drop`
/// closes the capture handle and joins the hot loop cleanly on exit.
fn run_and_block(engine: &Engine) -> Result<(), netgovern::CoreError> {
    engine.start()?;
    tracing::info!("netgovernd running");

    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
        let (dl, ul) = engine.snapshot_global_counters();
        tracing::info!(
            "processed={} dropped={} dl={}B/s ul={}B/s",
            engine.packets_processed(),
            engine.packets_dropped(),
            dl,
            ul
        );
    }
}
