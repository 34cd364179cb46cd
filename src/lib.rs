//! Per-process network bandwidth governor.
//!
//! `Engine` is the single public entry point: it owns the capture handle,
//! the rule store, the byte counters, and the two housekeeping threads (the
//! hot packet loop and the 1Hz adaptive/sampler ticker), and exposes the
//! control-surface operations a CLI or any other caller drives it through.

mod capture;
pub mod config;
mod core;
mod error;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use serde::Serialize;

pub use core::{GlobalRule, ProcessRule};
pub use core::rule_store::Direction;
pub use error::CoreError;

use core::adaptive::AdaptiveController;
use core::counters::Counters;
use core::engine::{EngineShared, InterceptEngine};
use core::port_resolver::PortResolver;
use core::rule_store::RuleStore;
use core::sampler::SamplerWindow;

/// Test-only surface: the in-process synthetic capture backend, so external
/// integration tests can drive `Engine` end-to-end without a kernel packet
/// hook. Only compiled for the crate's own tests or with `--features testutil`.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil {
    pub use crate::capture::null_backend::NullCapture;
    pub use crate::capture::{PacketAddr, PacketCapture, Protocol};
}

/// A process currently visible to the governor, for listing/UI purposes
/// (spec §6: `list_network_processes`).
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: Option<String>,
    pub rule: Option<ProcessRule>,
    pub download_bytes: u64,
    pub upload_bytes: u64,
}

struct Ticker {
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// Top-level governor handle. Not `Clone`; callers share it behind an `Arc`
/// if multiple owners are needed (mirrors the teacher's single `AppState`
/// pattern, minus the Tauri plumbing).
pub struct Engine {
    shared: Arc<EngineShared>,
    adaptive: Arc<AdaptiveController>,
    sampler: Arc<SamplerWindow>,
    intercept: Mutex<Option<InterceptEngine>>,
    ticker: Mutex<Option<Ticker>>,
}

impl Engine {
    pub fn new() -> Self {
        let rules = Arc::new(RuleStore::new());
        let counters = Arc::new(Counters::new());
        let resolver = Arc::new(PortResolver::new());
        Self {
            shared: Arc::new(EngineShared::new(rules, counters, resolver)),
            adaptive: Arc::new(AdaptiveController::new()),
            sampler: Arc::new(SamplerWindow::new()),
            intercept: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    /// Open the capture backend, spawn the hot loop, and spawn the 1Hz
    /// sampler/adaptive ticker. A second `start()` while already running is
    /// a no-op success (idempotent, spec §6).
    pub fn start(&self) -> Result<(), CoreError> {
        let mut intercept_guard = self.intercept.lock().unwrap();
        if intercept_guard.is_some() {
            return Ok(());
        }

        self.shared.resolver.refresh();
        let engine = InterceptEngine::start(Arc::clone(&self.shared))?;
        *intercept_guard = Some(engine);
        drop(intercept_guard);

        let mut ticker_guard = self.ticker.lock().unwrap();
        if ticker_guard.is_none() {
            *ticker_guard = Some(self.spawn_ticker());
        }
        Ok(())
    }

    /// Test-only seam: make `protocol`/`port` resolve to `pid` in the live
    /// port map without a real OS socket behind it, so an integration test
    /// can drive the hot loop against a chosen non-zero PID (spec §8
    /// scenario #4: per-process rule vs. a tighter global cap, which is
    /// dead code against the always-unresolved pid=0 a sandboxed test host
    /// produces).
    #[cfg(any(test, feature = "testutil"))]
    pub fn seed_port_for_test(&self, protocol: capture::Protocol, port: u16, pid: u32) {
        self.shared.resolver.seed_for_test(protocol, port, pid);
    }

    /// Same as `start`, but drives the hot loop off a caller-supplied
    /// capture backend instead of the platform default. Exists for
    /// integration tests that exercise the full pipeline against
    /// `testutil::NullCapture` without a kernel packet hook.
    #[cfg(any(test, feature = "testutil"))]
    pub fn start_with_capture(&self, capture: Arc<dyn capture::PacketCapture>) -> Result<(), CoreError> {
        let mut intercept_guard = self.intercept.lock().unwrap();
        if intercept_guard.is_some() {
            return Ok(());
        }

        self.shared.resolver.refresh();
        let engine = InterceptEngine::start_with_capture(capture, Arc::clone(&self.shared))?;
        *intercept_guard = Some(engine);
        drop(intercept_guard);

        let mut ticker_guard = self.ticker.lock().unwrap();
        if ticker_guard.is_none() {
            *ticker_guard = Some(self.spawn_ticker());
        }
        Ok(())
    }

    fn spawn_ticker(&self) -> Ticker {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let shared = Arc::clone(&self.shared);
        let adaptive = Arc::clone(&self.adaptive);
        let sampler = Arc::clone(&self.sampler);

        let handle = std::thread::Builder::new()
            .name("netgovern-ticker".into())
            .spawn(move || {
                while !stop_clone.load(Ordering::Relaxed) {
                    std::thread::sleep(config::TICK_INTERVAL);
                    if stop_clone.load(Ordering::Relaxed) {
                        break;
                    }
                    sampler.tick(&shared.counters);
                    tick_adaptive(&shared, &adaptive, &sampler);
                }
            })
            .expect("failed to spawn ticker thread");

        Ticker { stop, handle }
    }

    /// Stop the hot loop and the ticker, joining both with a bounded
    /// timeout. Calling `stop()` when not running is a no-op.
    pub fn stop(&self) {
        if let Some(engine) = self.intercept.lock().unwrap().take() {
            engine.stop();
        }
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.stop.store(true, Ordering::Relaxed);
            let _ = ticker.handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.intercept.lock().unwrap().is_some()
    }

    /// Replace the rule for `pid`. An empty (`has_any_rule() == false`) rule
    /// removes any existing entry (spec §3).
    pub fn set_rule(&self, pid: u32, rule: ProcessRule) {
        self.shared.rules.put(pid, rule, &self.shared.counters);
    }

    /// Apply the same rule to every PID in `pids` (spec §6).
    pub fn set_rule_for_pids(&self, pids: &[u32], rule: ProcessRule) {
        self.shared.rules.put_many(pids, rule, &self.shared.counters);
    }

    pub fn get_rule(&self, pid: u32) -> Option<ProcessRule> {
        self.shared.rules.get(pid)
    }

    pub fn set_global_rule(&self, rule: GlobalRule) {
        self.shared.rules.set_global(rule);
    }

    pub fn get_global_rule(&self) -> GlobalRule {
        self.shared.rules.get_global()
    }

    /// Snapshot-and-reset every per-PID counter (spec §4.4/§6).
    pub fn snapshot_counters(&self) -> std::collections::HashMap<u32, (u64, u64)> {
        self.shared.counters.snapshot_all()
    }

    /// Snapshot-and-reset the global counters.
    pub fn snapshot_global_counters(&self) -> (u64, u64) {
        self.shared.counters.snapshot_global()
    }

    pub fn packets_processed(&self) -> u64 {
        self.shared.packets_processed.load(Ordering::Relaxed)
    }

    pub fn packets_dropped(&self) -> u64 {
        self.shared.packets_dropped.load(Ordering::Relaxed)
    }

    /// Every PID the governor currently has visibility into: either a
    /// configured rule, or live (unreset) counter activity. PIDs that
    /// vanished between enumeration and name lookup are included with
    /// `name: None` rather than dropped (spec §7: `ProcessLookupFailure`
    /// is not fatal to the listing as a whole).
    pub fn list_network_processes(&self) -> Vec<ProcessInfo> {
        let mut pids: std::collections::HashSet<u32> =
            self.shared.rules.configured_pids().into_iter().collect();
        for pid in self.shared.counters.active_pids() {
            pids.insert(pid);
        }

        pids.into_iter()
            .map(|pid| {
                let (dl, ul) = self.shared.counters.peek(pid);
                ProcessInfo {
                    pid,
                    name: core::port_resolver::process_name(pid),
                    rule: self.shared.rules.get(pid),
                    download_bytes: dl,
                    upload_bytes: ul,
                }
            })
            .collect()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One adaptive-control tick across every currently-limited stream (spec
/// §4.7): global download/upload, then every per-PID rule with
/// `adaptive && limited`. Rules not eligible are skipped cheaply by
/// `AdaptiveController::tick_*` itself.
fn tick_adaptive(shared: &EngineShared, adaptive: &AdaptiveController, sampler: &SamplerWindow) {
    let global = shared.rules.get_global();
    if let Some(rate) = adaptive.tick_global(
        Direction::Download,
        global.download_kbps,
        global.adaptive,
        global.limit_download,
        global.adjusted_dl_rate,
        sampler.global_download_average(),
    ) {
        let mut updated = global;
        updated.adjusted_dl_rate = rate;
        shared.rules.set_global(updated);
    }

    let global = shared.rules.get_global();
    if let Some(rate) = adaptive.tick_global(
        Direction::Upload,
        global.upload_kbps,
        global.adaptive,
        global.limit_upload,
        global.adjusted_ul_rate,
        sampler.global_upload_average(),
    ) {
        let mut updated = global;
        updated.adjusted_ul_rate = rate;
        shared.rules.set_global(updated);
    }

    for pid in shared.rules.configured_pids() {
        let Some(rule) = shared.rules.get(pid) else { continue };

        if let Some(rate) = adaptive.tick_pid(
            pid,
            Direction::Download,
            rule.download_kbps,
            rule.adaptive,
            rule.limit_download,
            rule.adjusted_dl_rate,
            sampler.average(pid, Direction::Download),
        ) {
            let mut updated = rule;
            updated.adjusted_dl_rate = rate;
            shared.rules.put(pid, updated, &shared.counters);
        }

        let rule = shared.rules.get(pid).unwrap_or(rule);
        if let Some(rate) = adaptive.tick_pid(
            pid,
            Direction::Upload,
            rule.upload_kbps,
            rule.adaptive,
            rule.limit_upload,
            rule.adjusted_ul_rate,
            sampler.average(pid, Direction::Upload),
        ) {
            let mut updated = rule;
            updated.adjusted_ul_rate = rate;
            shared.rules.put(pid, updated, &shared.counters);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_engine_is_not_running() {
        let engine = Engine::new();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_set_and_get_rule_roundtrip() {
        let engine = Engine::new();
        let rule = ProcessRule { block_all: true, ..ProcessRule::default() };
        engine.set_rule(123, rule);
        assert_eq!(engine.get_rule(123), Some(rule));
    }

    #[test]
    fn test_set_rule_for_pids_applies_to_all() {
        let engine = Engine::new();
        let rule = ProcessRule { limit_download: true, download_kbps: 50, ..ProcessRule::default() };
        engine.set_rule_for_pids(&[1, 2, 3], rule);
        assert_eq!(engine.get_rule(1), Some(rule));
        assert_eq!(engine.get_rule(2), Some(rule));
        assert_eq!(engine.get_rule(3), Some(rule));
    }

    #[test]
    fn test_global_rule_roundtrip() {
        let engine = Engine::new();
        let rule = GlobalRule { block_all: true, ..GlobalRule::default() };
        engine.set_global_rule(rule);
        assert_eq!(engine.get_global_rule(), rule);
    }

    #[test]
    fn test_packet_counters_start_at_zero() {
        let engine = Engine::new();
        assert_eq!(engine.packets_processed(), 0);
        assert_eq!(engine.packets_dropped(), 0);
    }

    #[test]
    fn test_list_network_processes_includes_configured_pids_even_without_traffic() {
        let engine = Engine::new();
        engine.set_rule(55, ProcessRule { block_all: true, ..ProcessRule::default() });
        let list = engine.list_network_processes();
        assert!(list.iter().any(|p| p.pid == 55));
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let engine = Engine::new();
        engine.stop(); // must not panic
        assert!(!engine.is_running());
    }
}
