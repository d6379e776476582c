//! Per-flow token-bucket-like rate limiter (spec §4.3).
//!
//! Grounded on the teacher's single-flow accumulators: nothing in
//! `rneter` rate-limits a byte stream, but its `SessionRecorder`
//! (`session/recording.rs`) is the pack's precedent for a small
//! `Arc<Mutex<_>>`-guarded counter updated from async call sites, which
//! this limiter follows for its internal state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Signal returned by [`RateLimiter::check_and_update`] telling the caller
/// whether to pause the upstream byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSignal {
    Continue,
    Pause,
}

struct State {
    bytes_in_window: u64,
    window_start: Instant,
    paused: bool,
}

/// Single-flow limiter parameterised by `bytes_per_second` (0 = unlimited).
/// Does not pause streams itself; callers translate its signal into stream
/// control (spec §4.3: "the limiter itself does not pause streams").
pub struct RateLimiter {
    bytes_per_second: u64,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            state: Mutex::new(State { bytes_in_window: 0, window_start: Instant::now(), paused: false }),
        }
    }

    /// Accounts for `bytes` in the current window, resetting the window if
    /// a full second has elapsed. Returns [`RateSignal::Pause`] if this
    /// chunk would exceed the limit.
    pub fn check_and_update(&self, bytes: u64) -> RateSignal {
        if self.bytes_per_second == 0 {
            return RateSignal::Continue;
        }
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        if now.duration_since(state.window_start) >= Duration::from_secs(1) {
            state.window_start = now;
            state.bytes_in_window = 0;
        }
        if state.bytes_in_window + bytes > self.bytes_per_second {
            state.paused = true;
            return RateSignal::Pause;
        }
        state.bytes_in_window += bytes;
        RateSignal::Continue
    }

    /// Observed throughput for the current window, in bytes/sec.
    pub fn calculate_current_rate(&self) -> f64 {
        let state = self.state.lock().expect("rate limiter lock poisoned");
        let elapsed = state.window_start.elapsed().as_secs_f64().max(0.001);
        state.bytes_in_window as f64 / elapsed
    }

    pub fn get_elapsed_ms(&self) -> u128 {
        let state = self.state.lock().expect("rate limiter lock poisoned");
        state.window_start.elapsed().as_millis()
    }

    pub fn pause(&self) {
        self.state.lock().expect("rate limiter lock poisoned").paused = true;
    }

    /// Resumes the flow and resets the window, matching the spec's "schedule
    /// a resume at windowStart + 1s, then reset window" behaviour.
    pub fn resume(&self) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        state.paused = false;
        state.window_start = Instant::now();
        state.bytes_in_window = 0;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().expect("rate limiter lock poisoned").paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_limiter_never_pauses() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.check_and_update(1_000_000), RateSignal::Continue);
    }

    #[test]
    fn exceeding_window_budget_signals_pause() {
        let limiter = RateLimiter::new(100);
        assert_eq!(limiter.check_and_update(60), RateSignal::Continue);
        assert_eq!(limiter.check_and_update(60), RateSignal::Pause);
    }

    #[test]
    fn resume_resets_window_and_clears_paused() {
        let limiter = RateLimiter::new(100);
        limiter.check_and_update(100);
        assert!(!limiter.is_paused());
        limiter.pause();
        assert!(limiter.is_paused());
        limiter.resume();
        assert!(!limiter.is_paused());
        assert_eq!(limiter.check_and_update(50), RateSignal::Continue);
    }
}
