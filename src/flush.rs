//! Flush-trigger policy.
//!
//! One policy applies to the whole run, not per stream. The policy only
//! affects the memory/IO trade-off and how quickly data becomes durable;
//! it never changes what is recorded.

use std::time::{Duration, Instant};

/// Decides when a session's buffer should be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush once at least `threshold` samples arrived since the last flush.
    Count { threshold: usize },
    /// Flush once `every` has elapsed since the last flush.
    Interval { every: Duration },
}

/// Per-worker flush bookkeeping.
///
/// The trigger stays armed until [`FlushState::mark_flushed`] is called,
/// so a failed flush is retried on the next pull cycle.
#[derive(Debug)]
pub struct FlushState {
    policy: FlushPolicy,
    samples_since_flush: usize,
    last_flush: Instant,
}

impl FlushState {
    pub fn new(policy: FlushPolicy, now: Instant) -> Self {
        Self {
            policy,
            samples_since_flush: 0,
            last_flush: now,
        }
    }

    /// Records a completed pull and reports whether a flush is due.
    pub fn on_pull(&mut self, samples: usize, now: Instant) -> bool {
        match self.policy {
            FlushPolicy::Count { threshold } => {
                self.samples_since_flush = self.samples_since_flush.saturating_add(samples);
                self.samples_since_flush >= threshold
            }
            FlushPolicy::Interval { every } => now > self.last_flush + every,
        }
    }

    /// Resets the trigger after a successful flush.
    pub fn mark_flushed(&mut self, now: Instant) {
        self.samples_since_flush = 0;
        self.last_flush = now;
    }
}
