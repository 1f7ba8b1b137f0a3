//! Token-bucket admission control.
//!
//! Credits accrue continuously with wall-clock time and are spent by
//! acquisition attempts. The pipeline uses one limiter per expensive action
//! (reporting a server span, collecting a call tree, ...); when the backing
//! configuration value changes, the owning component replaces the limiter
//! instance wholesale rather than mutating it.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Configuration values of one million credits per minute or more disable
/// rate limiting entirely (no limiter is instantiated).
pub const UNLIMITED_CREDITS_PER_MINUTE: f64 = 1_000_000.0;

/// A token bucket: `balance` credits are available, refilled at
/// `max_credits_per_second` and capped at `max_balance`.
#[derive(Debug)]
pub struct RateLimiter {
    max_credits_per_second: f64,
    max_balance: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    balance: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter. Negative or NaN arguments are clamped to zero; a
    /// misconfigured limiter rejects rather than errors.
    pub fn new(max_credits_per_second: f64, max_balance: f64) -> Self {
        let max_credits_per_second = sanitize(max_credits_per_second);
        let max_balance = sanitize(max_balance);
        RateLimiter {
            max_credits_per_second,
            max_balance,
            state: Mutex::new(BucketState {
                balance: max_balance,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Derive a limiter from a credits-per-minute configuration value.
    ///
    /// Returns `None` for values of [`UNLIMITED_CREDITS_PER_MINUTE`] or more:
    /// no limiter means unrestricted admission. Values at or below zero
    /// produce a limiter that rejects everything, and fractional per-second
    /// rates get a balance cap of one so a single acquisition is admitted
    /// per refill cycle.
    pub fn from_credits_per_minute(credits_per_minute: f64) -> Option<RateLimiter> {
        if credits_per_minute >= UNLIMITED_CREDITS_PER_MINUTE {
            return None;
        }
        let max_credits_per_second = credits_per_minute / 60.0;
        let max_balance = if max_credits_per_second <= 0.0 {
            0.0
        } else if max_credits_per_second < 1.0 {
            1.0
        } else {
            max_credits_per_second
        };
        Some(RateLimiter::new(max_credits_per_second, max_balance))
    }

    /// Try to spend `cost` credits. Returns `true` and deducts the cost if
    /// the refilled balance covers it; otherwise returns `false` and leaves
    /// the balance unchanged.
    pub fn try_acquire(&self, cost: f64) -> bool {
        self.try_acquire_at(cost, Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, cost: f64, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.balance = (state.balance + elapsed.as_secs_f64() * self.max_credits_per_second)
            .min(self.max_balance);
        state.last_refill = now;
        if state.balance >= cost {
            state.balance -= cost;
            true
        } else {
            false
        }
    }

    /// The refill rate in credits per second.
    pub fn max_credits_per_second(&self) -> f64 {
        self.max_credits_per_second
    }

    /// The balance cap.
    pub fn max_balance(&self) -> f64 {
        self.max_balance
    }

    /// The current balance, refills not applied.
    pub fn balance(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .balance
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Whether an acquisition of one credit against an optional limiter fails.
/// An absent limiter never limits.
pub fn is_rate_exceeded(limiter: Option<&RateLimiter>) -> bool {
    limiter.map_or(false, |limiter| !limiter.try_acquire(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[test]
    fn unlimited_configuration_creates_no_limiter() {
        assert!(RateLimiter::from_credits_per_minute(1_000_000.0).is_none());
        assert!(RateLimiter::from_credits_per_minute(2_000_000.0).is_none());
        assert!(!is_rate_exceeded(None));
    }

    #[rstest]
    #[case(0.0, 0.0, 0.0)]
    #[case(-10.0, 0.0, 0.0)]
    #[case(30.0, 0.5, 1.0)]
    #[case(120.0, 2.0, 2.0)]
    fn construction_thresholds(
        #[case] credits_per_minute: f64,
        #[case] expected_rate: f64,
        #[case] expected_cap: f64,
    ) {
        let limiter = RateLimiter::from_credits_per_minute(credits_per_minute)
            .expect("a limiter should be created");
        assert_eq!(limiter.max_credits_per_second(), expected_rate);
        assert_eq!(limiter.max_balance(), expected_cap);
    }

    #[test]
    fn zero_credit_limiter_rejects_everything() {
        let limiter = RateLimiter::from_credits_per_minute(0.0).unwrap();
        for _ in 0..100 {
            assert!(!limiter.try_acquire(1.0));
        }
    }

    #[test]
    fn balance_stays_within_bounds() {
        let limiter = RateLimiter::new(2.0, 2.0);
        let start = Instant::now();
        for i in 0..1_000u32 {
            // Irregular time steps, some of them long enough to overfill.
            let now = start + Duration::from_millis(u64::from(i) * 137);
            limiter.try_acquire_at(1.0, now);
            let balance = limiter.balance();
            assert!(balance >= 0.0, "balance went negative: {balance}");
            assert!(balance <= 2.0, "balance exceeded cap: {balance}");
        }
    }

    #[test]
    fn credits_refill_over_time() {
        let limiter = RateLimiter::new(1.0, 1.0);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(1.0, start));
        assert!(!limiter.try_acquire_at(1.0, start));
        // Half a credit after 500ms is not enough.
        assert!(!limiter.try_acquire_at(1.0, start + Duration::from_millis(500)));
        assert!(limiter.try_acquire_at(1.0, start + Duration::from_millis(1_600)));
    }

    #[test]
    fn rejection_does_not_spend_credits() {
        let limiter = RateLimiter::new(0.5, 1.0);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(1.0, start));
        let before = limiter.balance();
        assert!(!limiter.try_acquire_at(1.0, start));
        assert_eq!(limiter.balance(), before);
    }

    #[test]
    fn fractional_rate_admits_single_burst() {
        // 30 credits per minute: one admission, then a two second wait.
        let limiter = RateLimiter::from_credits_per_minute(30.0).unwrap();
        let start = Instant::now();
        assert!(limiter.try_acquire_at(1.0, start));
        assert!(!limiter.try_acquire_at(1.0, start + Duration::from_millis(100)));
        assert!(limiter.try_acquire_at(1.0, start + Duration::from_secs(3)));
    }
}
