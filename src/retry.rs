//! Exponential backoff with jitter for tunnel reconnection attempts.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Cap on the exponent so the wait never overflows (base * 2^10 max).
const MAX_EXPONENT: u32 = 10;

/// Tracks consecutive failures for one retry loop and produces the wait
/// before the next attempt.
///
/// After a period of stable connectivity the owner may call
/// [`BackoffHandler::set_grace_period`] so the next failure retries quickly
/// instead of resuming the accumulated exponential wait.
#[derive(Debug, Clone)]
pub struct BackoffHandler {
    max_retries: u32,
    base_time: Duration,
    retry_forever: bool,
    retries: u32,
    grace_period: Option<Duration>,
}

impl BackoffHandler {
    pub fn new(max_retries: u32, base_time: Duration, retry_forever: bool) -> Self {
        Self {
            max_retries,
            base_time,
            retry_forever,
            retries: 0,
            grace_period: None,
        }
    }

    /// Maximum time until the next retry and whether more retries remain.
    /// `false` means the caller should give up.
    pub fn get_max_backoff_duration(&self) -> (Duration, bool) {
        if !self.retry_forever && self.retries >= self.max_retries {
            return (Duration::ZERO, false);
        }
        let d = match self.grace_period {
            Some(grace) => grace,
            None => exponential(self.base_time, self.retries),
        };
        (d, true)
    }

    /// Consume one retry and return the (jittered) wait before the next
    /// attempt. Callers are expected to have checked
    /// [`get_max_backoff_duration`](Self::get_max_backoff_duration) first.
    pub fn backoff_duration(&mut self) -> Duration {
        let d = match self.grace_period.take() {
            Some(grace) => grace,
            None => exponential(self.base_time, self.retries),
        };
        self.retries = self.retries.saturating_add(1);
        d + jitter(d)
    }

    pub fn reached_max_retries(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Clear the failure count, so the next wait starts from the base again.
    pub fn reset_now(&mut self) {
        self.retries = 0;
    }

    /// Arrange for the next failure to retry after only the base time.
    /// Called once every tunnel has (re)connected successfully.
    pub fn set_grace_period(&mut self) {
        self.retries = 0;
        self.grace_period = Some(self.base_time);
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

fn exponential(base: Duration, retries: u32) -> Duration {
    base.saturating_mul(1 << retries.min(MAX_EXPONENT))
}

/// Up to 25% of the wait, derived from the subsecond clock. Spreads herd
/// reconnections without pulling in an RNG.
fn jitter(d: Duration) -> Duration {
    if d.is_zero() {
        return d;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_nanos(nanos % (d.as_nanos() as u64 / 4).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_max_retries() {
        let mut b = BackoffHandler::new(2, Duration::from_secs(1), false);
        assert!(b.get_max_backoff_duration().1);
        b.backoff_duration();
        assert!(b.get_max_backoff_duration().1);
        b.backoff_duration();
        assert!(!b.get_max_backoff_duration().1);
        assert!(b.reached_max_retries());
    }

    #[test]
    fn retry_forever_never_gives_up() {
        let mut b = BackoffHandler::new(2, Duration::from_secs(1), true);
        for _ in 0..10 {
            b.backoff_duration();
        }
        assert!(b.get_max_backoff_duration().1);
        // The counter still reports max retries for protocol-fallback checks.
        assert!(b.reached_max_retries());
    }

    #[test]
    fn waits_grow_exponentially() {
        let mut b = BackoffHandler::new(5, Duration::from_secs(1), false);
        let first = b.get_max_backoff_duration().0;
        b.backoff_duration();
        let second = b.get_max_backoff_duration().0;
        b.backoff_duration();
        let third = b.get_max_backoff_duration().0;
        assert_eq!(first, Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(third, Duration::from_secs(4));
    }

    #[test]
    fn reset_is_idempotent_and_clears_retries() {
        let mut b = BackoffHandler::new(2, Duration::from_secs(1), false);
        b.backoff_duration();
        b.backoff_duration();
        assert!(b.reached_max_retries());
        b.reset_now();
        assert!(!b.reached_max_retries());
        b.reset_now();
        assert!(!b.reached_max_retries());
        assert!(b.get_max_backoff_duration().1);
    }

    #[test]
    fn grace_period_shortens_next_wait() {
        let mut b = BackoffHandler::new(8, Duration::from_secs(1), false);
        for _ in 0..4 {
            b.backoff_duration();
        }
        b.set_grace_period();
        let (d, more) = b.get_max_backoff_duration();
        assert!(more);
        assert_eq!(d, Duration::from_secs(1));
        // Grace applies to exactly one wait.
        b.backoff_duration();
        assert_eq!(b.get_max_backoff_duration().0, Duration::from_secs(2));
    }
}
