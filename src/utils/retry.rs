//! Reconnect backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. The builders feed
//! [`ReconnectPolicy::exponential`](crate::config::ReconnectPolicy::exponential),
//! which turns them into an attempt-indexed delay function.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Exponential backoff for broker reconnects: unbounded attempts between
/// `min_delay` and `max_delay`, optionally jittered.
pub fn reconnect_backoff(min_delay: Duration, max_delay: Duration, jitter: bool) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .without_max_times();
    if jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Delay of the given 1-based attempt under `builder`.
///
/// Attempt 0 is treated as attempt 1. If the builder is exhausted before
/// reaching `attempt`, its last delay is repeated.
pub fn nth_delay(builder: &ExponentialBuilder, attempt: u32) -> Duration {
    let mut last = Duration::ZERO;
    for delay in builder.clone().build().take(attempt.max(1) as usize) {
        last = delay;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_factor(2.0)
            .without_max_times()
    }

    #[test]
    fn test_nth_delay_grows_exponentially() {
        let builder = deterministic();
        assert_eq!(nth_delay(&builder, 1).as_millis(), 100);
        assert_eq!(nth_delay(&builder, 2).as_millis(), 200);
        assert_eq!(nth_delay(&builder, 3).as_millis(), 400);
    }

    #[test]
    fn test_nth_delay_is_capped() {
        assert_eq!(nth_delay(&deterministic(), 20).as_millis(), 1000);
    }

    #[test]
    fn test_nth_delay_treats_zero_as_first_attempt() {
        assert_eq!(nth_delay(&deterministic(), 0).as_millis(), 100);
    }

    #[test]
    fn test_reconnect_backoff_without_jitter_is_deterministic() {
        let builder = reconnect_backoff(Duration::from_millis(50), Duration::from_millis(300), false);
        assert_eq!(nth_delay(&builder, 1).as_millis(), 50);
        assert_eq!(nth_delay(&builder, 2).as_millis(), 100);
        assert_eq!(nth_delay(&builder, 10).as_millis(), 300);
    }

    #[test]
    fn test_reconnect_backoff_stays_within_bounds() {
        let builder = reconnect_backoff(Duration::from_millis(100), Duration::from_secs(30), true);
        for attempt in 1..40 {
            let delay = nth_delay(&builder, attempt);
            assert!(delay <= Duration::from_secs(60), "attempt {attempt}: {delay:?}");
        }
    }
}
