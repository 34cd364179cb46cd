//! End-to-end exercises of the full `Engine` against the in-process
//! synthetic capture backend, covering the six scenarios of spec.md §8.
//! Timing-sensitive assertions use statistical thresholds over
//! multi-packet/multi-second windows rather than single-packet predicates,
//! per the Design Notes.

use std::sync::Arc;
use std::time::Duration;

use netgovern::testutil::{NullCapture, PacketAddr, PacketCapture, Protocol};
use netgovern::{Engine, GlobalRule, ProcessRule};

fn tcp_packet(src_port: u16, dst_port: u16, total_len: u16) -> Vec<u8> {
    let mut pkt = vec![0u8; total_len as usize];
    pkt[0] = 0x45;
    pkt[2] = (total_len >> 8) as u8;
    pkt[3] = (total_len & 0xFF) as u8;
    pkt[9] = 6; // TCP
    pkt[20] = (src_port >> 8) as u8;
    pkt[21] = (src_port & 0xFF) as u8;
    pkt[22] = (dst_port >> 8) as u8;
    pkt[23] = (dst_port & 0xFF) as u8;
    pkt
}

fn spawn_engine_with(null: Arc<NullCapture>) -> Engine {
    let engine = Engine::new();
    let cap: Arc<dyn PacketCapture> = null;
    engine.start_with_capture(cap).expect("engine should start against NullCapture");
    engine
}

#[test]
fn scenario_pass_through_with_no_rules() {
    let null = Arc::new(NullCapture::new());
    let engine = spawn_engine_with(Arc::clone(&null));

    for i in 0..20 {
        null.inject(
            tcp_packet(30000 + i, 443, 64),
            PacketAddr { outbound: true, ipv6: false },
        );
    }
    std::thread::sleep(Duration::from_millis(200));
    engine.stop();

    assert_eq!(engine.packets_processed(), 20);
    assert_eq!(engine.packets_dropped(), 0);
    assert_eq!(null.sent.lock().unwrap().len(), 20);
}

#[test]
fn scenario_global_block_all_drops_every_packet() {
    let null = Arc::new(NullCapture::new());
    let engine = spawn_engine_with(Arc::clone(&null));
    engine.set_global_rule(GlobalRule { block_all: true, ..GlobalRule::default() });

    for i in 0..10 {
        null.inject(
            tcp_packet(40000 + i, 80, 64),
            PacketAddr { outbound: true, ipv6: false },
        );
    }
    std::thread::sleep(Duration::from_millis(200));
    engine.stop();

    assert_eq!(engine.packets_processed(), 10);
    assert_eq!(engine.packets_dropped(), 10);
    assert_eq!(null.sent.lock().unwrap().len(), 0);

    // Unconditional accounting still happened even though everything dropped.
    let (dl, _ul) = engine.snapshot_global_counters();
    assert!(dl > 0, "global counters must still record blocked traffic");
}

#[test]
fn scenario_global_rate_cap_drops_once_burst_is_spent() {
    let null = Arc::new(NullCapture::new());
    let engine = spawn_engine_with(Arc::clone(&null));
    // 1 kbps -> ~1024 B/s, burst ~2048B. Each packet is 512 bytes, so the
    // burst admits ~4 packets before the bucket runs dry.
    engine.set_global_rule(GlobalRule {
        limit_download: true,
        download_kbps: 1,
        ..GlobalRule::default()
    });

    for i in 0..30 {
        null.inject(
            tcp_packet(50000 + i, 443, 512),
            PacketAddr { outbound: true, ipv6: false },
        );
    }
    std::thread::sleep(Duration::from_millis(200));
    engine.stop();

    let sent = null.sent.lock().unwrap().len();
    assert!(sent < 30, "rate cap should have dropped some of the 30 packets");
    assert!(sent > 0, "burst should have admitted at least a few packets");
    assert_eq!(engine.packets_dropped(), 30 - sent as u64);
}

#[test]
fn scenario_per_process_limit_is_overridden_by_tighter_global_cap() {
    // A per-process rule alone would admit everything; a much tighter
    // global cap must still win (global enforcement runs before per-process).
    // This drives a real resolved (non-zero) PID through the pipeline via
    // `seed_port_for_test`, since a sandboxed test host never actually owns
    // the port in question and pid would otherwise stay 0, which bypasses
    // `passes_enforcement`'s per-process branch entirely and would let this
    // test pass without ever exercising the global-vs-per-process ordering
    // it claims to cover.
    const PID: u32 = 4242;
    const LOCAL_PORT: u16 = 61000;

    let null = Arc::new(NullCapture::new());
    let engine = spawn_engine_with(Arc::clone(&null));
    engine.seed_port_for_test(Protocol::Tcp, LOCAL_PORT, PID);

    engine.set_global_rule(GlobalRule {
        limit_download: true,
        download_kbps: 1,
        ..GlobalRule::default()
    });
    engine.set_rule(PID, ProcessRule {
        limit_download: true,
        download_kbps: 1_000_000,
        ..ProcessRule::default()
    });

    for i in 0..30 {
        // Inbound (download) packets addressed to the seeded local port,
        // so `local_port = dst_port` resolves to `PID` via the TCP map.
        null.inject(
            tcp_packet(60000 + i, LOCAL_PORT, 512),
            PacketAddr { outbound: false, ipv6: false },
        );
    }
    std::thread::sleep(Duration::from_millis(200));
    engine.stop();

    let sent = null.sent.lock().unwrap().len();
    assert!(sent < 30, "the tighter global cap must still bind regardless of the per-process rule");

    let snapshot = engine.snapshot_counters();
    let (dl, _ul) = snapshot.get(&PID).copied().unwrap_or((0, 0));
    assert!(dl > 0, "bytes must have been accounted against the resolved PID, not pid=0");
}

#[test]
fn scenario_ipv6_packets_bypass_accounting_and_enforcement() {
    let null = Arc::new(NullCapture::new());
    let engine = spawn_engine_with(Arc::clone(&null));
    engine.set_global_rule(GlobalRule { block_all: true, ..GlobalRule::default() });

    for _ in 0..5 {
        null.inject(vec![0x60, 0, 0, 0], PacketAddr { outbound: true, ipv6: true });
    }
    std::thread::sleep(Duration::from_millis(150));
    engine.stop();

    // IPv6 packets bypass the (active) global block entirely and are
    // reinjected untouched.
    assert_eq!(null.sent.lock().unwrap().len(), 5);
    assert_eq!(engine.packets_dropped(), 0);
    assert_eq!(engine.snapshot_global_counters(), (0, 0));
}

#[test]
fn scenario_empty_rule_clears_enforcement_and_restores_pass_through() {
    let null = Arc::new(NullCapture::new());
    let engine = spawn_engine_with(Arc::clone(&null));
    engine.set_rule(0, ProcessRule { block_all: true, ..ProcessRule::default() });
    assert!(engine.get_rule(0).is_some());

    engine.set_rule(0, ProcessRule::default());
    assert!(engine.get_rule(0).is_none());

    null.inject(tcp_packet(41000, 443, 64), PacketAddr { outbound: true, ipv6: false });
    std::thread::sleep(Duration::from_millis(150));
    engine.stop();

    // pid 0 never resolves from a real port table in this harness, so the
    // packet was always going through the "no rule" path either way — this
    // asserts the rule removal itself round-trips cleanly through the store.
    assert_eq!(null.sent.lock().unwrap().len(), 1);
}
