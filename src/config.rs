//! Centralized runtime constants for the bandwidth governor.
//!
//! All tunable intervals, thresholds, and counts are collected here so they can
//! be found and adjusted in a single place rather than scattered across modules.

use std::time::Duration;

/// Port map is refreshed when this much time has elapsed since the last refresh.
pub const PORT_REFRESH_INTERVAL: Duration = Duration::from_millis(1500);

/// Control ticker period: the adaptive controller and sampler both run once per tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how long `stop()` waits for the engine thread to join.
pub const ENGINE_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Fixed packet buffer size for `recv`.
pub const PACKET_BUFFER_SIZE: usize = 64 * 1024;

/// Token bucket burst depth, expressed as a multiple of the configured rate.
pub const BURST_MULTIPLIER: f64 = 2.0;

/// Number of 1-second samples kept per tracked stream in `SamplerWindow`.
pub const SAMPLER_WINDOW_LEN: usize = 5;

/// Below this measured rate (bytes/sec) the adaptive controller treats the
/// stream as idle and leaves the current rate untouched.
pub const ADAPTIVE_IDLE_FLOOR_BPS: f64 = 100.0;

/// ratio = measured / target thresholds that select a controller branch.
pub const ADAPTIVE_OVERSHOOT_RATIO: f64 = 1.02;
pub const ADAPTIVE_DEEP_UNDERSHOOT_RATIO: f64 = 0.90;
pub const ADAPTIVE_SLIGHT_UNDERSHOOT_RATIO: f64 = 0.98;

/// Gain applied when shrinking an overshooting rate: `current * (BASE + SLOPE * target/measured)`.
pub const ADAPTIVE_SHRINK_BASE: f64 = 0.3;
pub const ADAPTIVE_SHRINK_SLOPE: f64 = 0.7;

/// Gain applied when growing an undershooting rate.
pub const ADAPTIVE_DEEP_GROWTH: f64 = 1.15;
pub const ADAPTIVE_SLIGHT_GROWTH: f64 = 1.05;

/// The adaptive rate is never allowed below this fraction of target...
pub const ADAPTIVE_MIN_FRACTION: f64 = 0.05;
/// ...nor above the target itself.
pub const ADAPTIVE_MAX_FRACTION: f64 = 1.0;
