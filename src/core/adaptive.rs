//! Periodic proportional controller that rewrites bucket target rates to
//! drive measured throughput toward a configured target under noisy TCP
//! feedback (spec §4.7).
//!
//! Ticks once per second, reading `SamplerWindow` and writing
//! `adjusted_dl_rate`/`adjusted_ul_rate` back into `RuleStore` — the next
//! hot-loop packet picks the new rate up via `TokenBucket::set_rate`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{
    ADAPTIVE_DEEP_GROWTH, ADAPTIVE_DEEP_UNDERSHOOT_RATIO, ADAPTIVE_IDLE_FLOOR_BPS,
    ADAPTIVE_MAX_FRACTION, ADAPTIVE_MIN_FRACTION, ADAPTIVE_OVERSHOOT_RATIO, ADAPTIVE_SHRINK_BASE,
    ADAPTIVE_SHRINK_SLOPE, ADAPTIVE_SLIGHT_GROWTH, ADAPTIVE_SLIGHT_UNDERSHOOT_RATIO,
};
use crate::core::rule_store::Direction;

/// Tracking state for a single (stream, direction) controller instance,
/// kept outside `RuleStore` since it's purely a controller implementation
/// detail, not a user-visible policy field.
#[derive(Clone, Copy)]
struct StreamState {
    last_target: f64,
}

/// Which direction slots of a rule this controller is tracking.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum StreamKey {
    Pid(u32, Direction),
    Global(Direction),
}

pub struct AdaptiveController {
    state: Mutex<HashMap<StreamKey, StreamState>>,
}

impl AdaptiveController {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashMap::new()) }
    }

    /// Compute the next adjusted rate for one stream. `current` is the
    /// previous adjusted rate (or the target, on first iteration);
    /// `measured` is the rolling-average throughput in bytes/sec.
    pub fn step(&self, target: f64, measured: f64, current: f64) -> f64 {
        if target <= 0.0 {
            return current;
        }
        if measured < ADAPTIVE_IDLE_FLOOR_BPS {
            return current;
        }

        let ratio = measured / target;
        let new_rate = if ratio > ADAPTIVE_OVERSHOOT_RATIO {
            current * (ADAPTIVE_SHRINK_BASE + ADAPTIVE_SHRINK_SLOPE * (target / measured))
        } else if ratio < ADAPTIVE_DEEP_UNDERSHOOT_RATIO {
            current * ADAPTIVE_DEEP_GROWTH
        } else if ratio < ADAPTIVE_SLIGHT_UNDERSHOOT_RATIO {
            current * ADAPTIVE_SLIGHT_GROWTH
        } else {
            current
        };

        new_rate.clamp(ADAPTIVE_MIN_FRACTION * target, ADAPTIVE_MAX_FRACTION * target)
    }

    /// Run one tick for a single PID direction. Returns the new adjusted
    /// rate to write back into the rule, or `None` if the direction is not
    /// both adaptive and limited (nothing to do).
    pub fn tick_pid(
        &self,
        pid: u32,
        direction: Direction,
        target_kbps: u32,
        adaptive: bool,
        limited: bool,
        previous_adjusted: f64,
        measured: f64,
    ) -> Option<f64> {
        self.tick_stream(StreamKey::Pid(pid, direction), target_kbps, adaptive, limited, previous_adjusted, measured)
    }

    /// Same as `tick_pid` but for the singleton global rule.
    pub fn tick_global(
        &self,
        direction: Direction,
        target_kbps: u32,
        adaptive: bool,
        limited: bool,
        previous_adjusted: f64,
        measured: f64,
    ) -> Option<f64> {
        self.tick_stream(StreamKey::Global(direction), target_kbps, adaptive, limited, previous_adjusted, measured)
    }

    fn tick_stream(
        &self,
        key: StreamKey,
        target_kbps: u32,
        adaptive: bool,
        limited: bool,
        previous_adjusted: f64,
        measured: f64,
    ) -> Option<f64> {
        if !adaptive || !limited {
            self.state.lock().unwrap().remove(&key);
            return None;
        }

        let target = target_kbps as f64 * 1024.0;
        let mut states = self.state.lock().unwrap();
        let first_iteration = match states.get(&key) {
            Some(s) => s.last_target != target,
            None => true,
        };
        states.insert(key, StreamState { last_target: target });
        drop(states);

        let current = if first_iteration || previous_adjusted <= 0.0 {
            target
        } else {
            previous_adjusted
        };

        Some(self.step(target, measured, current))
    }
}

impl Default for AdaptiveController {
    fn default() -> Self {
        Self::new()
    }
}
