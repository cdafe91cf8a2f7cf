//! Poll timing.
//!
//! The maintainer never sleeps on an individual operation. Every pass asks,
//! from persisted timestamps alone, whether an operation is due:
//!
//! - **Retry**: a transient failure or an orphan-mitigated deletion is
//!   retried once `maintainer_retry_interval` has passed since its last update
//! - **Status poll**: an accepted broker job is polled once
//!   `poll_cascade_interval` has passed since its last update
//! - **Deadlines**: a tree gives up once `reconciliation_operation_timeout`
//!   has passed since its root was created; orphan mitigation gives up once
//!   `cascade_orphan_mitigation_timeout` has passed since it started
//!
//! Timestamps in the future (clock skew between workers) count as not
//! elapsed.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// True once at least `interval` has passed between `since` and `now`.
pub fn has_elapsed(since: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed >= interval)
}

/// True once strictly more than `limit` has passed between `since` and
/// `now`.
pub fn has_exceeded(since: DateTime<Utc>, limit: Duration, now: DateTime<Utc>) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::t0;
    use chrono::TimeDelta;

    #[test]
    fn elapsed_is_inclusive() {
        let interval = Duration::from_secs(60);
        assert!(!has_elapsed(t0(), interval, t0() + TimeDelta::seconds(59)));
        assert!(has_elapsed(t0(), interval, t0() + TimeDelta::seconds(60)));
    }

    #[test]
    fn exceeded_is_strict() {
        let limit = Duration::from_secs(60);
        assert!(!has_exceeded(t0(), limit, t0() + TimeDelta::seconds(60)));
        assert!(has_exceeded(t0(), limit, t0() + TimeDelta::seconds(61)));
    }

    #[test]
    fn future_timestamps_never_elapse() {
        let later = t0() + TimeDelta::hours(1);
        assert!(!has_elapsed(later, Duration::ZERO, t0()));
        assert!(!has_exceeded(later, Duration::ZERO, t0()));
    }

    #[test]
    fn zero_interval_elapses_immediately() {
        assert!(has_elapsed(t0(), Duration::ZERO, t0()));
        assert!(!has_exceeded(t0(), Duration::ZERO, t0()));
    }
}
