//! Typed access to the controller's persisted markers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::ForceRequest;
use crate::io::store::MarkerStore;

pub const LOCK_KEY: &str = "lock";
pub const FORCE_KEY: &str = "force";
pub const STOP_KEY: &str = "stop";
pub const TOKEN_KEY: &str = "token";
pub const LAST_PROGRAM_KEY: &str = "lastprogram.json";

/// Persisted record of the last handled scheduled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExecutionRecord {
    pub last_execution: DateTime<Utc>,
}

/// Result of reading the last-execution marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastExecution {
    /// A valid marker was found.
    Recorded(DateTime<Utc>),
    /// No marker existed; it was initialized to now.
    Initialized(DateTime<Utc>),
    /// The marker could not be parsed; it was reset to now.
    Reset { at: DateTime<Utc>, error: String },
}

impl LastExecution {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            LastExecution::Recorded(at) | LastExecution::Initialized(at) => *at,
            LastExecution::Reset { at, .. } => *at,
        }
    }
}

/// Persistent State Store: last execution, force, stop, and heartbeat markers.
#[derive(Clone, Copy)]
pub struct StateStore<'a> {
    store: &'a dyn MarkerStore,
}

impl<'a> StateStore<'a> {
    pub fn new(store: &'a dyn MarkerStore) -> Self {
        Self { store }
    }

    pub fn markers(&self) -> &'a dyn MarkerStore {
        self.store
    }

    /// Read the last handled execution, initializing it to `now` when it is
    /// missing or unparsable so a lost schedule memory waits for the next slot.
    pub fn read_last_execution(&self, now: DateTime<Utc>) -> Result<LastExecution> {
        let Some(raw) = self.store.read(LAST_PROGRAM_KEY)? else {
            self.write_last_execution(now)?;
            return Ok(LastExecution::Initialized(now));
        };
        match serde_json::from_str::<LastExecutionRecord>(&raw) {
            Ok(record) => Ok(LastExecution::Recorded(record.last_execution)),
            Err(err) => {
                self.write_last_execution(now)?;
                Ok(LastExecution::Reset {
                    at: now,
                    error: err.to_string(),
                })
            }
        }
    }

    /// Read the last handled execution without repairing the marker.
    ///
    /// An unparsable marker reads as `None` and is left for the next loop
    /// invocation to reset.
    pub fn peek_last_execution(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.read(LAST_PROGRAM_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<LastExecutionRecord>(&raw) {
            Ok(record) => Ok(Some(record.last_execution)),
            Err(err) => {
                warn!(err = %err, "ignoring unparsable last execution marker");
                Ok(None)
            }
        }
    }

    pub fn write_last_execution(&self, at: DateTime<Utc>) -> Result<()> {
        debug!(last_execution = %at, "writing last execution");
        let mut buf = serde_json::to_string_pretty(&LastExecutionRecord { last_execution: at })?;
        buf.push('\n');
        self.store.write(LAST_PROGRAM_KEY, &buf)
    }

    /// Pending force request, if any.
    ///
    /// Errors when the marker exists but does not hold a valid request.
    pub fn force_request(&self) -> Result<Option<ForceRequest>> {
        let Some(raw) = self.store.read(FORCE_KEY)? else {
            return Ok(None);
        };
        let request = serde_json::from_str(&raw).context("parse force request")?;
        Ok(Some(request))
    }

    pub fn write_force_request(&self, request: &ForceRequest) -> Result<()> {
        let buf = serde_json::to_string(request)?;
        self.store.write(FORCE_KEY, &buf)
    }

    /// Remove the force marker. Returns false if none was pending.
    pub fn clear_force_request(&self) -> Result<bool> {
        self.store.remove(FORCE_KEY)
    }

    pub fn stop_requested(&self) -> Result<bool> {
        self.store.exists(STOP_KEY)
    }

    pub fn request_stop(&self) -> Result<()> {
        self.store.write(STOP_KEY, "")
    }

    pub fn clear_stop_request(&self) -> Result<bool> {
        self.store.remove(STOP_KEY)
    }

    /// Record that a loop invocation completed its core work.
    pub fn touch_heartbeat(&self) -> Result<()> {
        self.store.write(TOKEN_KEY, "")
    }

    /// When the last loop invocation completed, if ever.
    pub fn last_loop_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.store.modified_at(TOKEN_KEY)
    }
}
