//! Heartbeat freshness check used by external health checks.

use chrono::{DateTime, TimeDelta, Utc};

/// Returns true if the last completed loop is younger than `max_age`.
///
/// A missing heartbeat means the loop has never completed.
pub fn is_looping_correctly(
    last_loop: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age: TimeDelta,
) -> bool {
    match last_loop {
        Some(last) => now - last < max_age,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn heartbeat_age_is_compared_strictly() {
        let now = Utc.with_ymd_and_hms(2023, 4, 27, 12, 0, 0).unwrap();
        let max = TimeDelta::minutes(10);
        assert!(is_looping_correctly(Some(now - TimeDelta::minutes(9)), now, max));
        assert!(!is_looping_correctly(Some(now - TimeDelta::minutes(10)), now, max));
        assert!(!is_looping_correctly(None, now, max));
    }
}
