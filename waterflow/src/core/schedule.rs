//! Deterministic next-program resolution.
//!
//! A program's trigger instant is its wall-clock `start_time` on a local
//! calendar day. Persisted timestamps are UTC, so every candidate is converted
//! to UTC before it is compared with the last handled execution.

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};

use crate::core::types::Program;

/// The next program to run and the instant it becomes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueProgram {
    /// Index of the program in the configured list.
    pub index: usize,
    pub name: String,
    pub due: DateTime<Utc>,
}

/// Find the earliest enabled program whose trigger instant today is strictly
/// after `last_execution`, rolling over to the earliest enabled program
/// tomorrow when every slot today has already been handled.
///
/// Returns `None` when no program is enabled.
pub fn resolve<Tz: TimeZone>(
    programs: &[Program],
    last_execution: DateTime<Utc>,
    now: &DateTime<Tz>,
) -> Option<DueProgram> {
    let ordered = enabled_by_start_time(programs);
    let first = *ordered.first()?;

    let tz = now.timezone();
    let today = now.date_naive();
    for &index in &ordered {
        let program = &programs[index];
        let Some(candidate) = localize(&tz, today, program.start_time) else {
            continue;
        };
        if candidate > last_execution {
            return Some(DueProgram {
                index,
                name: program.name.clone(),
                due: candidate,
            });
        }
    }

    let tomorrow = today.checked_add_days(Days::new(1))?;
    let program = &programs[first];
    let due = localize(&tz, tomorrow, program.start_time)?;
    Some(DueProgram {
        index: first,
        name: program.name.clone(),
        due,
    })
}

/// Indices of enabled programs, ordered by start time. Ties keep config order.
pub fn enabled_by_start_time(programs: &[Program]) -> Vec<usize> {
    let mut ordered: Vec<usize> = programs
        .iter()
        .enumerate()
        .filter(|(_, program)| program.enabled)
        .map(|(index, _)| index)
        .collect();
    ordered.sort_by_key(|&index| programs[index].start_time);
    ordered
}

/// Resolve a local wall-clock time on `date` to a UTC instant.
///
/// Ambiguous times (clocks going back) take the earliest instant. Times inside
/// a gap (clocks going forward) take the same wall time one hour later.
fn localize<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    let local = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(naive + TimeDelta::hours(1)))
            .earliest()?,
    };
    Some(local.with_timezone(&Utc))
}
