//! Shared deterministic types for the controller core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-triggered watering schedule entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    /// Local wall-clock time of day at which the program is due.
    pub start_time: NaiveTime,
    pub enabled: bool,
    /// Run duration in minutes per valve index. Zero skips the valve.
    pub valves_times: Vec<u32>,
}

/// A physical valve and the relay pin that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valve {
    pub pin: u32,
}

/// What an operator asked to run outside the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForceKind {
    Program,
    Valve,
}

/// One-off run request persisted in the `force` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceRequest {
    #[serde(rename = "type")]
    pub kind: ForceKind,
    /// Index into the configured program or valve list.
    pub value: usize,
}

/// Which path started an actuation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Forced,
}

impl Trigger {
    pub fn is_forced(self) -> bool {
        matches!(self, Trigger::Forced)
    }
}

/// Record of what an actuation sequence physically did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Valve indices that were energized, in order.
    pub energized: Vec<usize>,
    /// Valve indices that were skipped (zero duration or stop pending).
    pub skipped: Vec<usize>,
    /// True when a stop request cut the sequence short.
    pub stopped: bool,
}

/// Why a due program was not run but still consumed its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The skip hook declined the program.
    Hook,
    /// The invocation arrived more than `max_loop_time` after the due time.
    WindowExceeded,
}

/// Terminal state of one loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Another invocation holds a live lock; nothing was done.
    LockBusy,
    /// A stop request was consumed; forced and scheduled work were skipped.
    Stopped,
    ForcedExecuted {
        request: ForceRequest,
        report: RunReport,
    },
    ScheduledExecuted {
        program: String,
        due: DateTime<Utc>,
        report: RunReport,
    },
    ScheduledSkipped {
        program: String,
        due: DateTime<Utc>,
        reason: SkipReason,
    },
    /// The next program is not due yet.
    Waiting {
        program: String,
        due: DateTime<Utc>,
    },
    NoActiveProgram,
}
