//! Decide what to do with a resolved due slot.

use chrono::{DateTime, TimeDelta, Utc};

use crate::core::types::SkipReason;

/// Outcome of comparing the current instant against a due slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// Not due yet; the last-execution marker must stay untouched.
    Wait,
    /// Due and inside the execution window.
    Run,
    /// Due, but deliberately not run. The slot is still consumed.
    Skip(SkipReason),
}

impl SlotDecision {
    /// Whether this decision consumes the slot (advances the last-execution marker).
    pub fn consumes_slot(self) -> bool {
        !matches!(self, SlotDecision::Wait)
    }
}

/// Classify a due slot.
///
/// The slot is runnable from `due` until `due + window`, inclusive. A skip hook
/// only matters once the slot is reached.
pub fn decide(now: DateTime<Utc>, due: DateTime<Utc>, window: TimeDelta, skip: bool) -> SlotDecision {
    let reached = now >= due;
    if !reached {
        return SlotDecision::Wait;
    }
    let exceeded = now > due + window;
    if exceeded {
        return SlotDecision::Skip(SkipReason::WindowExceeded);
    }
    if skip {
        return SlotDecision::Skip(SkipReason::Hook);
    }
    SlotDecision::Run
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    #[test]
    fn before_due_waits_even_when_hook_skips() {
        let due = at("2023-04-27T05:06:00Z");
        let window = TimeDelta::minutes(10);
        assert_eq!(decide(at("2023-04-27T05:05:59Z"), due, window, false), SlotDecision::Wait);
        assert_eq!(decide(at("2023-04-27T05:05:59Z"), due, window, true), SlotDecision::Wait);
        assert!(!SlotDecision::Wait.consumes_slot());
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let due = at("2023-04-27T05:06:00Z");
        let window = TimeDelta::minutes(10);
        assert_eq!(decide(due, due, window, false), SlotDecision::Run);
        assert_eq!(decide(at("2023-04-27T05:16:00Z"), due, window, false), SlotDecision::Run);
        assert_eq!(
            decide(at("2023-04-27T05:16:01Z"), due, window, false),
            SlotDecision::Skip(SkipReason::WindowExceeded)
        );
    }

    #[test]
    fn hook_skip_consumes_slot() {
        let due = at("2023-04-27T05:06:00Z");
        let decision = decide(at("2023-04-27T05:07:00Z"), due, TimeDelta::minutes(10), true);
        assert_eq!(decision, SlotDecision::Skip(SkipReason::Hook));
        assert!(decision.consumes_slot());
    }
}
