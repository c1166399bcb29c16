//! Best-effort action metrics.
//!
//! Emission is fire-and-forget: a sink never returns an error to the caller,
//! it traces the failure and drops the event.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

pub const MEASUREMENT: &str = "waterflow";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricTags {
    pub action: String,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricFields {
    /// True when a stop request cut the action short.
    pub stopped: bool,
}

/// One action event, tagged `{action, forced}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricEvent {
    pub measurement: &'static str,
    pub time: DateTime<Utc>,
    pub tags: MetricTags,
    pub fields: MetricFields,
}

impl MetricEvent {
    pub fn action(action: impl Into<String>, forced: bool, stopped: bool) -> Self {
        Self {
            measurement: MEASUREMENT,
            time: Utc::now(),
            tags: MetricTags {
                action: action.into(),
                forced,
            },
            fields: MetricFields { stopped },
        }
    }
}

pub trait MetricsSink {
    fn emit(&self, event: &MetricEvent);
}

/// Sink used when metrics are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn emit(&self, event: &MetricEvent) {
        debug!(action = %event.tags.action, "metrics disabled, event dropped");
    }
}

/// Sink that appends one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlMetrics {
    path: PathBuf,
}

impl JsonlMetrics {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, event: &MetricEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create metrics dir {}", parent.display()))?;
        }
        let line = serde_json::to_string(event).context("serialize metric event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append {}", self.path.display()))
    }
}

impl MetricsSink for JsonlMetrics {
    fn emit(&self, event: &MetricEvent) {
        if let Err(err) = self.append(event) {
            warn!(err = %err, action = %event.tags.action, "metric emit failed");
        }
    }
}
