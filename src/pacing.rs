//! Framerate pacing for the producer
//!
//! Deadlines are absolute: each send is scheduled exactly one interval after the
//! previous *deadline*, not after the moment the thread actually woke up. Sleep
//! overshoot therefore never accumulates into drift. A caller that falls behind
//! skips the missed slots instead of bursting to catch up.

use std::time::{Duration, Instant};
use tracing::trace;

use crate::sync::CancelSignal;
use crate::{CameraError, Result};

/// Absolute-deadline rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next_deadline: Option<Instant>,
}

impl RateLimiter {
    /// Pace at `framerate` frames per second; 0 disables pacing.
    pub fn new(framerate: f32) -> Self {
        let interval = if framerate > 0.0 {
            Duration::try_from_secs_f64(1.0 / framerate as f64).ok()
        } else {
            None
        };
        Self { interval, next_deadline: None }
    }

    /// The ideal inter-frame interval, if pacing is active.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// When the next paced send will be released.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_deadline
    }

    /// Forget the schedule; the next call starts a new one.
    pub fn reset(&mut self) {
        self.next_deadline = None;
    }

    /// Hold the caller until its send slot.
    ///
    /// The first call only starts the schedule. Later calls wait for the current
    /// deadline and advance it by one interval, or, when already late, proceed at
    /// once and move the deadline to the next slot in the future. Cancellation of
    /// the owning session aborts the wait with `SessionDeleted`.
    pub fn gate(&mut self, cancel: &CancelSignal) -> Result<()> {
        let Some(interval) = self.interval else {
            return Ok(());
        };

        let now = Instant::now();
        let Some(deadline) = self.next_deadline else {
            self.next_deadline = Some(now + interval);
            return Ok(());
        };

        if now < deadline {
            if cancel.wait_until(deadline) {
                return Err(CameraError::SessionDeleted);
            }
            self.next_deadline = Some(deadline + interval);
        } else {
            let next = advance_deadline(deadline, now, interval);
            trace!(late_by = ?(now - deadline), "Send is late, skipping missed slots");
            self.next_deadline = Some(next);
        }
        Ok(())
    }
}

/// First deadline after `now` on the grid `deadline + k * interval`, `k >= 1`.
pub fn advance_deadline(deadline: Instant, now: Instant, interval: Duration) -> Instant {
    if interval.is_zero() {
        return now;
    }
    let behind = now.saturating_duration_since(deadline);
    let missed = behind.as_nanos() / interval.as_nanos();
    let steps = u32::try_from(missed + 1).unwrap_or(u32::MAX);
    deadline + interval.saturating_mul(steps)
}
