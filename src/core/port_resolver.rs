//! Builds and caches mappings local-port -> owning PID, for TCP and UDP
//! independently (spec §4.2).
//!
//! Each protocol's map is published as an immutable `Arc<HashMap>`; the
//! refresher builds a brand new map off-path and swaps the `Arc` reference
//! under a short-lived write lock, so readers either see the complete old
//! map or the complete new one, never a partial rebuild (Design Notes,
//! spec §9: "atomic map publication... over an immutable map, not a mutex
//! protecting a mutable map").

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::capture::Protocol;

type PortMap = Arc<HashMap<u16, u32>>;

fn empty_map() -> PortMap {
    Arc::new(HashMap::new())
}

pub struct PortResolver {
    tcp: RwLock<PortMap>,
    udp: RwLock<PortMap>,
    /// Nanoseconds since an arbitrary epoch (the resolver's creation time),
    /// so refresh timing survives being read from multiple threads without
    /// a `Mutex<Instant>` (Instant isn't `Copy`-into-atomics directly).
    created_at: Instant,
    last_refresh_nanos: AtomicI64,
}

impl PortResolver {
    pub fn new() -> Self {
        Self {
            tcp: RwLock::new(empty_map()),
            udp: RwLock::new(empty_map()),
            created_at: Instant::now(),
            last_refresh_nanos: AtomicI64::new(i64::MIN),
        }
    }

    /// Resolve `(protocol, local_port)` to its owning PID, or `0` if unknown.
    pub fn resolve(&self, protocol: Protocol, port: u16) -> u32 {
        let map = match protocol {
            Protocol::Tcp => self.tcp.read().unwrap().clone(),
            Protocol::Udp => self.udp.read().unwrap().clone(),
        };
        map.get(&port).copied().unwrap_or(0)
    }

    /// Rebuild both maps from the OS and publish them atomically.
    pub fn refresh(&self) {
        let (tcp_map, udp_map) = scan_os_tables();
        *self.tcp.write().unwrap() = Arc::new(tcp_map);
        *self.udp.write().unwrap() = Arc::new(udp_map);
        let elapsed = self.created_at.elapsed().as_nanos() as i64;
        self.last_refresh_nanos.store(elapsed, Ordering::Relaxed);
    }

    /// Refresh only if at least `interval` has elapsed since the last
    /// refresh (spec §4.2: engine calls this opportunistically at 1.5s).
    pub fn refresh_if_stale(&self, interval: Duration) {
        let last = self.last_refresh_nanos.load(Ordering::Relaxed);
        let now = self.created_at.elapsed().as_nanos() as i64;
        if last == i64::MIN || now.saturating_sub(last) >= interval.as_nanos() as i64 {
            self.refresh();
        }
    }

    /// Test-only seam: insert `port -> pid` directly into the live map,
    /// bypassing `scan_os_tables`. Integration tests run in a sandboxed
    /// process that doesn't actually own the sockets it wants to exercise
    /// per-PID policy against, so this is how they get the hot loop to
    /// resolve a chosen non-zero PID without a real OS port table entry.
    #[cfg(any(test, feature = "testutil"))]
    pub fn seed_for_test(&self, protocol: Protocol, port: u16, pid: u32) {
        let lock = match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        };
        let mut map = (**lock.read().unwrap()).clone();
        map.insert(port, pid);
        *lock.write().unwrap() = Arc::new(map);
    }
}

impl Default for PortResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "windows")]
fn scan_os_tables() -> (HashMap<u16, u32>, HashMap<u16, u32>) {
    crate::core::win_net_table::scan()
}

#[cfg(target_os = "macos")]
fn scan_os_tables() -> (HashMap<u16, u32>, HashMap<u16, u32>) {
    // No IPv4 port->PID syscall table on macOS; shell out to `lsof`, the
    // same approach NetLimiter-style macOS tools use absent a native API.
    let mut tcp = HashMap::new();
    let mut udp = HashMap::new();

    let Ok(output) = std::process::Command::new("lsof")
        .args(["-n", "-P", "-iTCP", "-iUDP"])
        .output()
    else {
        tracing::warn!("lsof unavailable; port resolution degraded to unknown-PID");
        return (tcp, udp);
    };

    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else { continue };
        let is_tcp = fields[7].eq_ignore_ascii_case("tcp");
        let is_udp = fields[7].eq_ignore_ascii_case("udp");
        if !is_tcp && !is_udp {
            continue;
        }
        let Some(port_str) = fields[8].rsplit(':').next() else { continue };
        let Ok(port) = port_str.trim_end_matches("(LISTEN)").parse::<u16>() else { continue };
        if is_tcp {
            tcp.insert(port, pid);
        } else {
            udp.insert(port, pid);
        }
    }
    (tcp, udp)
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn scan_os_tables() -> (HashMap<u16, u32>, HashMap<u16, u32>) {
    (HashMap::new(), HashMap::new())
}

/// Look up a process name for display purposes. Transient failures (dead
/// process between enumeration and lookup) are not errors — callers skip
/// the PID silently (spec §7: `ProcessLookupFailure`).
pub fn process_name(pid: u32) -> Option<String> {
    use sysinfo::{Pid, System};
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys.process(Pid::from_u32(pid))
        .map(|p| p.name().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_unknown_port_returns_zero() {
        let r = PortResolver::new();
        assert_eq!(r.resolve(Protocol::Tcp, 12345), 0);
    }

    #[test]
    fn test_refresh_publishes_atomically() {
        let r = PortResolver::new();
        // Before any refresh, reads see the (consistent, empty) initial map.
        assert_eq!(r.resolve(Protocol::Tcp, 1), 0);
        r.refresh();
        // After refresh, still a fully-formed map (possibly empty on a
        // sandboxed test host, but never partial/inconsistent).
        let _ = r.resolve(Protocol::Udp, 1);
    }

    #[test]
    fn test_refresh_if_stale_runs_on_first_call() {
        let r = PortResolver::new();
        r.refresh_if_stale(Duration::from_secs(1000));
        assert_ne!(r.last_refresh_nanos.load(Ordering::Relaxed), i64::MIN);
    }

    #[test]
    fn test_refresh_if_stale_skips_when_recent() {
        let r = PortResolver::new();
        r.refresh();
        let first = r.last_refresh_nanos.load(Ordering::Relaxed);
        r.refresh_if_stale(Duration::from_secs(1000));
        let second = r.last_refresh_nanos.load(Ordering::Relaxed);
        assert_eq!(first, second, "refresh_if_stale must not refresh before the interval elapses");
    }
}
