//! Per-PID and global byte counters with atomic snapshot-and-reset.
//!
//! Per-PID state lives in a `DashMap` (teacher's choice for lock-free
//! concurrent per-PID state in `core/traffic.rs`) so the hot loop's
//! fetch-adds never contend with the control thread's snapshot reads.
//! Snapshot is a swap-with-zero on each field independently — the pair is
//! not atomic as a whole, which is fine: readers tolerate DL/UL being
//! sampled a few nanoseconds apart (spec §4.4).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Paired download/upload byte counters for one PID.
#[derive(Default)]
struct PidCounters {
    dl_bytes: AtomicU64,
    ul_bytes: AtomicU64,
}

/// Per-PID and global byte accounting.
pub struct Counters {
    per_pid: DashMap<u32, PidCounters>,
    global_dl: AtomicU64,
    global_ul: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            per_pid: DashMap::new(),
            global_dl: AtomicU64::new(0),
            global_ul: AtomicU64::new(0),
        }
    }

    /// Add `len` bytes to PID `pid`'s download counter. Lazily creates the
    /// entry on first sighting (spec §3: "created on first sighting").
    pub fn add_download(&self, pid: u32, len: u64) {
        self.per_pid
            .entry(pid)
            .or_default()
            .dl_bytes
            .fetch_add(len, Ordering::Relaxed);
    }

    /// Add `len` bytes to PID `pid`'s upload counter.
    pub fn add_upload(&self, pid: u32, len: u64) {
        self.per_pid
            .entry(pid)
            .or_default()
            .ul_bytes
            .fetch_add(len, Ordering::Relaxed);
    }

    /// Add `len` bytes to the global download counter (unconditional —
    /// called regardless of whether a PID could be resolved, spec §4.6
    /// step 8).
    pub fn add_global_download(&self, len: u64) {
        self.global_dl.fetch_add(len, Ordering::Relaxed);
    }

    /// Add `len` bytes to the global upload counter.
    pub fn add_global_upload(&self, len: u64) {
        self.global_ul.fetch_add(len, Ordering::Relaxed);
    }

    /// Snapshot and zero every per-PID counter. Entries with both fields
    /// still at zero after the swap are left in place (so a process that
    /// currently has zero traffic does not need to be rediscovered).
    pub fn snapshot_all(&self) -> std::collections::HashMap<u32, (u64, u64)> {
        self.per_pid
            .iter()
            .map(|entry| {
                let dl = entry.dl_bytes.swap(0, Ordering::Relaxed);
                let ul = entry.ul_bytes.swap(0, Ordering::Relaxed);
                (*entry.key(), (dl, ul))
            })
            .collect()
    }

    /// Snapshot and zero the two global counters.
    pub fn snapshot_global(&self) -> (u64, u64) {
        (
            self.global_dl.swap(0, Ordering::Relaxed),
            self.global_ul.swap(0, Ordering::Relaxed),
        )
    }

    /// Remove a PID's counters entirely (used when its last rule is
    /// removed, so a stale PID does not linger forever in the map).
    pub fn remove(&self, pid: u32) {
        self.per_pid.remove(&pid);
    }

    /// Current (unsnapshotted) totals for a PID, read-only — used by the
    /// sampler, which must not disturb the counters it's ticking off of.
    pub fn peek(&self, pid: u32) -> (u64, u64) {
        self.per_pid
            .get(&pid)
            .map(|c| {
                (
                    c.dl_bytes.load(Ordering::Relaxed),
                    c.ul_bytes.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }

    /// All PIDs with a live counter entry (used to drive sampler ticks and
    /// `list_network_processes`).
    pub fn active_pids(&self) -> Vec<u32> {
        self.per_pid.iter().map(|e| *e.key()).collect()
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}
