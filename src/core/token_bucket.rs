//! Thread-safe token-bucket rate limiter with live rate update and burst cap.
//!
//! Generalizes the refill/consume arithmetic the rate limiter has always
//! used (monotonic-time refill, burst = a multiple of rate) to the policer
//! contract the engine needs: `try_consume` either passes or drops, it
//! never reports a "wait this long" delay — a drop is the signal TCP's
//! congestion control reacts to, so there is nothing to wait for.

use std::sync::Mutex;
use std::time::Instant;

use crate::config::BURST_MULTIPLIER;

struct State {
    tokens: f64,
    max_tokens: f64,
    rate: f64,
    last_refill: Instant,
}

/// A single-direction token bucket. `0 ≤ tokens ≤ max_tokens = BURST_MULTIPLIER * rate`
/// holds at every observable point.
pub struct TokenBucket {
    state: Mutex<State>,
}

impl TokenBucket {
    /// New bucket at `rate` bytes/sec, starting full (so the first burst
    /// after creation is never throttled below the configured burst depth).
    pub fn new(rate: f64) -> Self {
        let rate = rate.max(0.0);
        let max_tokens = rate * BURST_MULTIPLIER;
        Self {
            state: Mutex::new(State {
                tokens: max_tokens,
                max_tokens,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Update the rate (and therefore the burst cap). Tokens in excess of
    /// the new cap are clamped down; tokens are never bumped up just
    /// because the rate increased.
    pub fn set_rate(&self, rate: f64) {
        let rate = rate.max(0.0);
        let mut s = self.state.lock().unwrap();
        s.rate = rate;
        s.max_tokens = rate * BURST_MULTIPLIER;
        if s.tokens > s.max_tokens {
            s.tokens = s.max_tokens;
        }
    }

    /// Refill from elapsed monotonic time, then attempt to withdraw `n`
    /// tokens. On success, tokens are debited and `true` is returned. On
    /// failure, tokens are left untouched (no refund, no debt — a dropped
    /// packet does not get to consume future capacity) and `false` is
    /// returned.
    pub fn try_consume(&self, n: u32) -> bool {
        let mut s = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(s.last_refill).as_secs_f64();
        s.last_refill = now;

        s.tokens = (s.tokens + elapsed * s.rate).min(s.max_tokens);

        let n = n as f64;
        if s.tokens >= n {
            s.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Current rate in bytes/sec, mainly for tests and diagnostics.
    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    /// Current token count, mainly for tests and diagnostics.
    pub fn tokens(&self) -> f64 {
        self.state.lock().unwrap().tokens
    }
}
