//! Fixed-width rolling average of 1-second throughput samples, per PID and
//! direction plus two global streams.
//!
//! Ring of size `SAMPLER_WINDOW_LEN`, enqueue newest / drop oldest. Every
//! tick, every PID with an active counter AND every PID that had history
//! but not this tick gets a sample pushed — zero for the latter, so its
//! average decays toward zero rather than freezing at its last value
//! (spec §4.8).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::config::SAMPLER_WINDOW_LEN;
use crate::core::counters::Counters;
use crate::core::rule_store::Direction;

#[derive(Default)]
struct Ring(VecDeque<f64>);

impl Ring {
    fn push(&mut self, sample: f64) {
        if self.0.len() == SAMPLER_WINDOW_LEN {
            self.0.pop_front();
        }
        self.0.push_back(sample);
    }

    fn average(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        self.0.iter().sum::<f64>() / self.0.len() as f64
    }
}

/// Rolling per-PID/direction and global throughput averages.
pub struct SamplerWindow {
    per_pid: Mutex<HashMap<(u32, Direction), Ring>>,
    global_dl: Mutex<Ring>,
    global_ul: Mutex<Ring>,
}

impl SamplerWindow {
    pub fn new() -> Self {
        Self {
            per_pid: Mutex::new(HashMap::new()),
            global_dl: Mutex::new(Ring::default()),
            global_ul: Mutex::new(Ring::default()),
        }
    }

    /// Run one tick: snapshot-and-reset every counter (tick period is 1s,
    /// so the bytes drained by the snapshot *are* the bytes/sec sample —
    /// spec §4.4's counters expose no other read primitive) and push one
    /// sample per known stream, pushing a zero for any PID that has gone
    /// silent so its average decays rather than sticking.
    pub fn tick(&self, counters: &Counters) {
        let mut map = self.per_pid.lock().unwrap();
        let snapshot = counters.snapshot_all();

        let mut pids: std::collections::HashSet<u32> = snapshot.keys().copied().collect();
        for (pid, _) in map.keys() {
            pids.insert(*pid);
        }

        for pid in pids {
            let (dl, ul) = snapshot.get(&pid).copied().unwrap_or((0, 0));
            map.entry((pid, Direction::Download)).or_default().push(dl as f64);
            map.entry((pid, Direction::Upload)).or_default().push(ul as f64);
        }

        // The global counters are incremented unconditionally (even for
        // pid=0 traffic that never lands in `per_pid`, spec §4.6 step 8),
        // so they must be snapshotted directly rather than re-derived by
        // summing the per-PID snapshot.
        let (gdl, gul) = counters.snapshot_global();
        self.global_dl.lock().unwrap().push(gdl as f64);
        self.global_ul.lock().unwrap().push(gul as f64);
    }

    /// Average bytes/sec for a PID's direction over the current window.
    pub fn average(&self, pid: u32, direction: Direction) -> f64 {
        self.per_pid
            .lock()
            .unwrap()
            .get(&(pid, direction))
            .map(Ring::average)
            .unwrap_or(0.0)
    }

    pub fn global_download_average(&self) -> f64 {
        self.global_dl.lock().unwrap().average()
    }

    pub fn global_upload_average(&self) -> f64 {
        self.global_ul.lock().unwrap().average()
    }
}

impl Default for SamplerWindow {
    fn default() -> Self {
        Self::new()
    }
}
