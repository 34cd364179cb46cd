//! Core logic: port resolution, token-bucket rate limiting, rule storage,
//! byte counters, sampling, adaptive control, and the hot packet loop.

pub mod adaptive;
pub mod counters;
pub mod engine;
pub mod port_resolver;
pub mod rule_store;
pub mod sampler;
pub mod token_bucket;

#[cfg(target_os = "windows")]
pub mod win_net_table;

pub use rule_store::{GlobalRule, ProcessRule};
