//! Throughput rate gating for document copy pipelines
//!
//! This crate provides the rate math used to hold a pipeline's trailing
//! average throughput under a configured cap. Unlike a token bucket, the gate
//! is recomputed from *cumulative* counters on every call: it answers the
//! question "how long must we pause so that `total / (elapsed + pause)` drops
//! back to the cap?". Because the pause is derived from the whole history
//! rather than a per-interval budget, the trailing average converges on the
//! cap instead of oscillating around it.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::RateGate;
//! use std::time::Duration;
//!
//! # async fn example() {
//! // cap at 500 events per second
//! let gate = RateGate::per_sec(500.0).unwrap();
//!
//! // in the aggregation loop, before processing the next completion:
//! let total_events = 12_345u64;
//! let elapsed = Duration::from_secs(20);
//! gate.pace(total_events, elapsed).await;
//! # }
//! ```
//!
//! The same gate works for bytes/sec by feeding it cumulative byte counts.
//! Which counter feeds the gate is the caller's choice; the two are never
//! combined.

use std::time::Duration;

/// Sleep-based rate gate driven by cumulative counters.
#[derive(Debug, Clone, Copy)]
pub struct RateGate {
    cap_per_sec: f64,
}

impl RateGate {
    /// Creates a gate holding throughput under `cap` units per second.
    ///
    /// Returns `None` for a non-positive cap (no throttling configured).
    pub fn per_sec(cap: f64) -> Option<Self> {
        if cap > 0.0 {
            Some(Self { cap_per_sec: cap })
        } else {
            None
        }
    }

    /// Configured cap in units per second.
    pub fn cap(&self) -> f64 {
        self.cap_per_sec
    }

    /// Minimal pause that brings the trailing average back under the cap.
    ///
    /// Returns `Duration::ZERO` when the average is already at or below the
    /// cap. The result is exact for the given counters; callers re-invoke
    /// with fresh cumulative values each iteration.
    pub fn required_pause(&self, cumulative: u64, elapsed: Duration) -> Duration {
        if cumulative == 0 {
            return Duration::ZERO;
        }
        let target_secs = cumulative as f64 / self.cap_per_sec;
        let elapsed_secs = elapsed.as_secs_f64();
        if target_secs <= elapsed_secs {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(target_secs - elapsed_secs)
    }

    /// Sleeps for [`RateGate::required_pause`] if it is non-zero.
    pub async fn pace(&self, cumulative: u64, elapsed: Duration) {
        let pause = self.required_pause(cumulative, elapsed);
        if pause > Duration::ZERO {
            tracing::trace!("rate gate pausing for {:?}", &pause);
            tokio::time::sleep(pause).await;
        }
    }
}
