//! Operator-side operations: request a forced run or a stop, inspect status.
//!
//! These never actuate hardware. They only write or read markers, which the
//! next loop invocation consumes.

use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, warn};

use crate::core::health::is_looping_correctly;
use crate::core::schedule::{DueProgram, resolve};
use crate::core::types::{ForceKind, ForceRequest};
use crate::io::config::WaterflowConfig;
use crate::io::state::StateStore;

/// Ask the next loop invocation to run a program or valve now.
///
/// Rejects indices outside the configured program or valve list.
pub fn request_force(
    config: &WaterflowConfig,
    state: &StateStore<'_>,
    kind: ForceKind,
    index: usize,
) -> Result<ForceRequest> {
    let available = match kind {
        ForceKind::Program => config.programs.len(),
        ForceKind::Valve => config.valves.len(),
    };
    if index >= available {
        bail!("cannot force {kind:?} {index}: only {available} configured");
    }
    let request = ForceRequest { kind, value: index };
    state.write_force_request(&request)?;
    info!(?kind, index, "force requested");
    Ok(request)
}

/// Ask the running sequence (and the next invocation) to stop.
pub fn request_stop(state: &StateStore<'_>) -> Result<()> {
    state.request_stop()?;
    info!("stop requested");
    Ok(())
}

/// Next program that the loop will run, based on the persisted last execution.
pub fn next_program<Tz: TimeZone>(
    config: &WaterflowConfig,
    state: &StateStore<'_>,
    now: &DateTime<Tz>,
) -> Result<Option<DueProgram>> {
    let last = state
        .peek_last_execution()?
        .unwrap_or_else(|| now.with_timezone(&Utc));
    Ok(resolve(&config.programs, last, now))
}

/// Operator log line announcing the next program, in `now`'s timezone.
pub fn next_program_message<Tz>(
    config: &WaterflowConfig,
    state: &StateStore<'_>,
    now: &DateTime<Tz>,
) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    Ok(match next_program(config, state, now)? {
        Some(next) => format!(
            "Next program: {} ({}).",
            next.due
                .with_timezone(&now.timezone())
                .format("%Y-%m-%d %H:%M:%S"),
            next.name
        ),
        None => "NO active program!".to_string(),
    })
}

/// Snapshot answered to remote viewers and health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub last_loop: Option<DateTime<Utc>>,
    pub looping_correctly: bool,
    pub forced: Option<ForceRequest>,
    pub stop_requested: bool,
    pub next: Option<DueProgram>,
}

pub fn status<Tz: TimeZone>(
    config: &WaterflowConfig,
    state: &StateStore<'_>,
    now: &DateTime<Tz>,
) -> Result<StatusReport> {
    let now_utc = now.with_timezone(&Utc);
    let last_loop = state.last_loop_time()?;
    Ok(StatusReport {
        last_loop,
        looping_correctly: is_looping_correctly(last_loop, now_utc, config.max_loop_delta()),
        forced: pending_force(state),
        stop_requested: state.stop_requested()?,
        next: next_program(config, state, now)?,
    })
}

/// An unreadable force marker is reported as no request. The next loop
/// invocation logs and discards it.
fn pending_force(state: &StateStore<'_>) -> Option<ForceRequest> {
    match state.force_request() {
        Ok(request) => request,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "ignoring unreadable force request");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state::{FORCE_KEY, LAST_PROGRAM_KEY, STOP_KEY};
    use crate::test_support::{MemoryStore, at, sample_config};

    #[test]
    fn force_writes_marker_for_valid_index() {
        let store = MemoryStore::new(at("2023-04-27T08:00:00Z"));
        let state = StateStore::new(&store);
        let config = sample_config();

        request_force(&config, &state, ForceKind::Valve, 1).expect("force");
        assert_eq!(
            store.get(FORCE_KEY).as_deref(),
            Some(r#"{"type":"valve","value":1}"#)
        );
    }

    #[test]
    fn force_rejects_out_of_range_index() {
        let store = MemoryStore::new(at("2023-04-27T08:00:00Z"));
        let state = StateStore::new(&store);
        let config = sample_config();

        assert!(request_force(&config, &state, ForceKind::Program, 2).is_err());
        assert!(!store.contains(FORCE_KEY));
    }

    #[test]
    fn stop_touches_marker() {
        let store = MemoryStore::new(at("2023-04-27T08:00:00Z"));
        request_stop(&StateStore::new(&store)).expect("stop");
        assert!(store.contains(STOP_KEY));
    }

    #[test]
    fn status_reports_stalled_loop_and_pending_requests() {
        let store = MemoryStore::new(at("2023-04-27T08:00:00Z"));
        let state = StateStore::new(&store);
        let config = sample_config();
        state.touch_heartbeat().expect("touch");
        request_stop(&state).expect("stop");
        request_force(&config, &state, ForceKind::Program, 0).expect("force");
        state
            .write_last_execution(at("2023-04-27T07:00:00Z"))
            .expect("last");

        let fresh = status(&config, &state, &at("2023-04-27T08:05:00Z")).expect("status");
        assert!(fresh.looping_correctly);
        assert!(fresh.stop_requested);
        assert_eq!(
            fresh.forced,
            Some(ForceRequest {
                kind: ForceKind::Program,
                value: 0
            })
        );
        let next = fresh.next.expect("next");
        assert_eq!(next.name, "first");
        assert_eq!(next.due, at("2023-04-27T23:30:00Z"));

        let stale = status(&config, &state, &at("2023-04-27T08:30:00Z")).expect("status");
        assert!(!stale.looping_correctly);
        assert_eq!(stale.last_loop, Some(at("2023-04-27T08:00:00Z")));
    }

    #[test]
    fn status_survives_unreadable_markers() {
        let store = MemoryStore::new(at("2023-04-27T08:00:00Z"));
        store.insert(FORCE_KEY, "program 3");
        store.insert(LAST_PROGRAM_KEY, "not json");
        let state = StateStore::new(&store);
        let config = sample_config();

        let report = status(&config, &state, &at("2023-04-27T08:00:00Z")).expect("status");
        assert_eq!(report.forced, None);
        assert!(!report.stop_requested);
        assert_eq!(report.next.expect("next").name, "first");
        assert_eq!(store.get(FORCE_KEY).as_deref(), Some("program 3"));
        assert_eq!(store.get(LAST_PROGRAM_KEY).as_deref(), Some("not json"));
    }

    #[test]
    fn next_program_message_reports_no_active_program() {
        let store = MemoryStore::new(at("2023-04-27T08:00:00Z"));
        let state = StateStore::new(&store);
        let mut config = sample_config();
        for program in &mut config.programs {
            program.enabled = false;
        }
        let message =
            next_program_message(&config, &state, &at("2023-04-27T08:00:00Z")).expect("message");
        assert_eq!(message, "NO active program!");
    }
}
