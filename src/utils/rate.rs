use crate::utils::CancelToken;
use std::thread;
use std::time::{Duration, Instant};

/// Periodic wake-up scheduler.
///
/// Deadlines sit on a fixed grid `start + k * period`. A caller that falls
/// behind skips the missed grid points instead of bursting through them, so
/// the wake-up rate never exceeds `1 / period`, even right after a stall.
#[derive(Debug, Clone)]
pub struct Rate {
    period: Duration,
    next: Instant,
}

impl Rate {
    /// First deadline is one period from now. A zero period is clamped to 1ns.
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now())
    }

    /// Build a rate whose grid starts at `start` (first deadline `start + period`).
    pub fn starting_at(period: Duration, start: Instant) -> Self {
        let period = period.max(Duration::from_nanos(1));
        Self {
            period,
            next: start + period,
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Deadline the next `sleep` will wait for if it is called before it passes.
    #[inline]
    pub fn next_deadline(&self) -> Instant {
        self.next
    }

    /// Compute the deadline to wake at, given the current time, and move the
    /// grid forward past it.
    ///
    /// If `now` is before the pending deadline, that deadline is returned.
    /// Otherwise the smallest grid point strictly after `now` is returned.
    pub fn advance(&mut self, now: Instant) -> Instant {
        if now >= self.next {
            let behind = (now - self.next).as_nanos();
            let period = self.period.as_nanos();
            let steps = behind / period + 1;
            self.next += mul_duration(self.period, steps);
        }
        let wake = self.next;
        self.next = wake + self.period;
        wake
    }

    /// Block until the next deadline.
    pub fn sleep(&mut self) {
        let wake = self.advance(Instant::now());
        let now = Instant::now();
        if wake > now {
            thread::sleep(wake - now);
        }
    }

    /// Like [`Rate::sleep`] but returns false as soon as `cancel` fires.
    pub fn sleep_cancellable(&mut self, cancel: &CancelToken) -> bool {
        let wake = self.advance(Instant::now());
        cancel.sleep_until_cancellable(wake)
    }
}

fn mul_duration(period: Duration, steps: u128) -> Duration {
    let nanos = period.as_nanos().saturating_mul(steps);
    let secs = (nanos / 1_000_000_000).min(u64::MAX as u128) as u64;
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}
