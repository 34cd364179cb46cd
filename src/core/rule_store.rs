//! Authoritative map PID -> rule, plus the singleton global rule.
//!
//! The teacher's rate limiter manager (`core/rate_limiter.rs`) splits
//! "blocked" and "limited" across two parallel `Mutex`-guarded collections.
//! Here a single `ProcessRule` per PID covers both, stored in a `DashMap`
//! so the rare control-path mutation never blocks the hot loop's lookups
//! (Design Notes, spec §9: "pick a map with fine-grained locking or a
//! sharded read-mostly structure").

use std::sync::RwLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core::counters::Counters;
use crate::core::token_bucket::TokenBucket;

/// Per-PID bandwidth policy (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessRule {
    pub block_all: bool,
    pub limit_download: bool,
    pub download_kbps: u32,
    pub limit_upload: bool,
    pub upload_kbps: u32,
    pub adaptive: bool,
    pub adjusted_dl_rate: f64,
    pub adjusted_ul_rate: f64,
}

impl Default for ProcessRule {
    fn default() -> Self {
        Self {
            block_all: false,
            limit_download: false,
            download_kbps: 0,
            limit_upload: false,
            upload_kbps: 0,
            adaptive: false,
            adjusted_dl_rate: 0.0,
            adjusted_ul_rate: 0.0,
        }
    }
}

impl ProcessRule {
    /// `has_any_rule = block_all ∨ (limit_dl ∧ dl_kbps>0) ∨ (limit_ul ∧ ul_kbps>0)` (spec §3).
    pub fn has_any_rule(&self) -> bool {
        self.block_all
            || (self.limit_download && self.download_kbps > 0)
            || (self.limit_upload && self.upload_kbps > 0)
    }
}

/// Process-wide policy, same shape as `ProcessRule` without PID scoping.
/// Default is all-false/zero, i.e. no effect (spec §3).
pub type GlobalRule = ProcessRule;

/// A rule plus the two lazily-created token buckets that enforce it.
struct RuleEntry {
    rule: ProcessRule,
    download_bucket: Option<TokenBucket>,
    upload_bucket: Option<TokenBucket>,
}

impl RuleEntry {
    fn new(rule: ProcessRule) -> Self {
        Self {
            rule,
            download_bucket: None,
            upload_bucket: None,
        }
    }
}

/// Direction a packet travels, from the local process's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Authoritative rule storage: a concurrent map of per-PID rules plus one
/// global rule, with lazily-materialized token buckets per (PID, direction)
/// and per (global, direction).
pub struct RuleStore {
    per_pid: DashMap<u32, RuleEntry>,
    global: RwLock<RuleEntry>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            per_pid: DashMap::new(),
            global: RwLock::new(RuleEntry::new(GlobalRule::default())),
        }
    }

    /// Insert or replace the rule for `pid`. If the rule is empty
    /// (`has_any_rule() == false`), remove the entry instead AND drop its
    /// two buckets — an empty rule MUST NOT occupy space (spec §3, §4.5).
    pub fn put(&self, pid: u32, rule: ProcessRule, counters: &Counters) {
        if rule.has_any_rule() {
            match self.per_pid.get_mut(&pid) {
                Some(mut entry) => entry.rule = rule,
                None => {
                    self.per_pid.insert(pid, RuleEntry::new(rule));
                }
            }
        } else {
            self.per_pid.remove(&pid);
            counters.remove(pid);
        }
    }

    /// Clone `rule` onto every PID in `pids`; equivalent to a loop of `put`.
    pub fn put_many(&self, pids: &[u32], rule: ProcessRule, counters: &Counters) {
        for &pid in pids {
            self.put(pid, rule, counters);
        }
    }

    pub fn get(&self, pid: u32) -> Option<ProcessRule> {
        self.per_pid.get(&pid).map(|e| e.rule)
    }

    pub fn set_global(&self, rule: GlobalRule) {
        self.global.write().unwrap().rule = rule;
    }

    pub fn get_global(&self) -> GlobalRule {
        self.global.read().unwrap().rule
    }

    /// All PIDs currently holding a rule (used by `list_network_processes`).
    pub fn configured_pids(&self) -> Vec<u32> {
        self.per_pid.iter().map(|e| *e.key()).collect()
    }

    /// Get-or-create the bucket for (pid, direction) at `rate`, updating
    /// the rate on an existing bucket rather than recreating it (spec
    /// §4.6 step 10: "lazily create or update").
    pub fn rate_limit_pid(&self, pid: u32, direction: Direction, rate: f64, len: u32) -> bool {
        let Some(mut entry) = self.per_pid.get_mut(&pid) else {
            return true;
        };
        let bucket = match direction {
            Direction::Download => &mut entry.download_bucket,
            Direction::Upload => &mut entry.upload_bucket,
        };
        match bucket {
            Some(b) => {
                b.set_rate(rate);
                b.try_consume(len)
            }
            None => {
                let b = TokenBucket::new(rate);
                let pass = b.try_consume(len);
                *bucket = Some(b);
                pass
            }
        }
    }

    /// Same as `rate_limit_pid` but against the singleton global rule's
    /// buckets (spec §4.6 step 9).
    pub fn rate_limit_global(&self, direction: Direction, rate: f64, len: u32) -> bool {
        let mut entry = self.global.write().unwrap();
        let bucket = match direction {
            Direction::Download => &mut entry.download_bucket,
            Direction::Upload => &mut entry.upload_bucket,
        };
        match bucket {
            Some(b) => {
                b.set_rate(rate);
                b.try_consume(len)
            }
            None => {
                let b = TokenBucket::new(rate);
                let pass = b.try_consume(len);
                *bucket = Some(b);
                pass
            }
        }
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited_rule(dl_kbps: u32) -> ProcessRule {
        ProcessRule {
            limit_download: true,
            download_kbps: dl_kbps,
            ..ProcessRule::default()
        }
    }

    #[test]
    fn test_has_any_rule_false_for_default() {
        assert!(!ProcessRule::default().has_any_rule());
    }

    #[test]
    fn test_has_any_rule_true_for_block_all() {
        let r = ProcessRule { block_all: true, ..ProcessRule::default() };
        assert!(r.has_any_rule());
    }

    #[test]
    fn test_has_any_rule_requires_nonzero_kbps() {
        let r = ProcessRule { limit_download: true, download_kbps: 0, ..ProcessRule::default() };
        assert!(!r.has_any_rule());
    }

    #[test]
    fn test_set_rule_then_get_rule_roundtrip() {
        let store = RuleStore::new();
        let counters = Counters::new();
        let rule = limited_rule(100);
        store.put(42, rule, &counters);
        assert_eq!(store.get(42), Some(rule));
    }

    #[test]
    fn test_put_empty_rule_removes_entry() {
        let store = RuleStore::new();
        let counters = Counters::new();
        store.put(42, limited_rule(100), &counters);
        assert!(store.get(42).is_some());
        store.put(42, ProcessRule::default(), &counters);
        assert_eq!(store.get(42), None);
    }

    #[test]
    fn test_removing_last_rule_drops_buckets_via_counters() {
        let store = RuleStore::new();
        let counters = Counters::new();
        counters.add_download(42, 123);
        store.put(42, limited_rule(100), &counters);
        store.put(42, ProcessRule::default(), &counters);
        assert_eq!(counters.peek(42), (0, 0));
        assert!(!counters.active_pids().contains(&42));
    }

    #[test]
    fn test_get_unknown_pid_is_none() {
        let store = RuleStore::new();
        assert_eq!(store.get(999), None);
    }

    #[test]
    fn test_global_rule_default_has_no_effect() {
        let store = RuleStore::new();
        assert!(!store.get_global().has_any_rule());
    }

    #[test]
    fn test_set_and_get_global_rule() {
        let store = RuleStore::new();
        let rule = limited_rule(50);
        store.set_global(rule);
        assert_eq!(store.get_global(), rule);
    }

    #[test]
    fn test_put_many_applies_to_all_pids() {
        let store = RuleStore::new();
        let counters = Counters::new();
        let rule = limited_rule(10);
        store.put_many(&[1, 2, 3], rule, &counters);
        assert_eq!(store.get(1), Some(rule));
        assert_eq!(store.get(2), Some(rule));
        assert_eq!(store.get(3), Some(rule));
    }

    #[test]
    fn test_rate_limit_pid_without_rule_passes() {
        let store = RuleStore::new();
        assert!(store.rate_limit_pid(999, Direction::Download, 1000.0, 10));
    }

    #[test]
    fn test_rate_limit_pid_enforces_after_rule_set() {
        let store = RuleStore::new();
        let counters = Counters::new();
        store.put(42, limited_rule(1), &counters); // 1 kbps -> ~1024 B/s, burst 2048
        assert!(store.rate_limit_pid(42, Direction::Download, 1024.0, 2048));
        assert!(!store.rate_limit_pid(42, Direction::Download, 1024.0, 2048));
    }

    #[test]
    fn test_rate_limit_global_independent_bucket() {
        let store = RuleStore::new();
        assert!(store.rate_limit_global(Direction::Upload, 1000.0, 500));
    }
}
