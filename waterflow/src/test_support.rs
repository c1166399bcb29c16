//! Test-only fakes for the controller's collaborators.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use embedded_hal::digital::PinState;

use crate::core::types::{Program, Valve};
use crate::io::config::{DriverKind, WaterflowConfig, write_config};
use crate::io::init::WaterflowPaths;
use crate::io::metrics::{MetricEvent, MetricsSink};
use crate::io::oplog::{Level, OperatorLog};
use crate::io::pacer::Pacer;
use crate::io::state::STOP_KEY;
use crate::io::store::{FsMarkerStore, MarkerStore};
use crate::io::valve::{Direction, ValveDriver};

/// Parse an RFC 3339 timestamp into UTC.
pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .unwrap_or_else(|err| panic!("invalid timestamp {s}: {err}"))
        .with_timezone(&Utc)
}

fn program(name: &str, hour: u32, minute: u32, valves_times: Vec<u32>) -> Program {
    Program {
        name: name.to_string(),
        start_time: NaiveTime::from_hms_opt(hour, minute, 0)
            .unwrap_or_else(|| panic!("invalid time {hour}:{minute}")),
        enabled: true,
        valves_times,
    }
}

/// Two valves and two enabled programs listed out of chronological order:
/// `first` at 23:30 and `second` at 05:06, one minute per valve.
pub fn sample_config() -> WaterflowConfig {
    WaterflowConfig {
        max_loop_time: 10,
        max_valve_time: 10,
        metrics: false,
        driver: DriverKind::Simulated,
        inverter_relay_pin: 18,
        external_ac_signal_pin: None,
        valves: vec![Valve { pin: 23 }, Valve { pin: 24 }],
        programs: vec![
            program("first", 23, 30, vec![1, 1]),
            program("second", 5, 6, vec![1, 1]),
        ],
        ..WaterflowConfig::default()
    }
}

/// Config and state directory inside a temporary directory.
pub struct TestHome {
    pub temp: tempfile::TempDir,
    pub paths: WaterflowPaths,
}

impl TestHome {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WaterflowPaths::new(temp.path().join("config.toml"), temp.path().join("var"));
        Self { temp, paths }
    }

    /// Write `config` and create the state directory.
    pub fn with_config(config: &WaterflowConfig) -> Self {
        let home = Self::new();
        std::fs::create_dir_all(&home.paths.state_dir).expect("create state dir");
        write_config(&home.paths.config_path, config).expect("write config");
        home
    }

    pub fn store(&self) -> FsMarkerStore {
        FsMarkerStore::new(self.paths.state_dir.clone())
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory marker store with a settable clock for modification times.
#[derive(Debug)]
pub struct MemoryStore {
    now: Cell<DateTime<Utc>>,
    markers: RefCell<BTreeMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryStore {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
            markers: RefCell::new(BTreeMap::new()),
        }
    }

    /// Set the time stamped on subsequent writes.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }

    pub fn insert(&self, key: &str, contents: &str) {
        self.markers
            .borrow_mut()
            .insert(key.to_string(), (contents.to_string(), self.now.get()));
    }

    /// Insert a marker with an explicit modification time.
    pub fn insert_at(&self, key: &str, contents: &str, modified: DateTime<Utc>) {
        self.markers
            .borrow_mut()
            .insert(key.to_string(), (contents.to_string(), modified));
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.markers.borrow().get(key).map(|(contents, _)| contents.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.markers.borrow().contains_key(key)
    }
}

impl MarkerStore for MemoryStore {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains(key))
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key))
    }

    fn write(&self, key: &str, contents: &str) -> Result<()> {
        self.insert(key, contents);
        Ok(())
    }

    fn create(&self, key: &str) -> Result<bool> {
        if self.contains(key) {
            return Ok(false);
        }
        self.insert(key, "");
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.markers.borrow_mut().remove(key).is_some())
    }

    fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.markers.borrow().get(key).map(|(_, modified)| *modified))
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Valve driver that records every successful transition.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    configured: RefCell<Vec<(u32, Direction)>>,
    transitions: RefCell<Vec<(u32, PinState)>>,
    fail_on: Cell<Option<(u32, PinState)>>,
}

impl RecordingDriver {
    /// Make `set(pin, level)` fail from now on.
    pub fn fail_on(&self, pin: u32, level: PinState) {
        self.fail_on.set(Some((pin, level)));
    }

    pub fn configured(&self) -> Vec<(u32, Direction)> {
        self.configured.borrow().clone()
    }

    pub fn transitions(&self) -> Vec<(u32, PinState)> {
        self.transitions.borrow().clone()
    }

    /// Pins driven high, in order.
    pub fn high_transitions(&self) -> Vec<u32> {
        self.transitions
            .borrow()
            .iter()
            .filter(|(_, level)| *level == PinState::High)
            .map(|(pin, _)| *pin)
            .collect()
    }

    /// Last level successfully written to `pin`.
    pub fn level(&self, pin: u32) -> Option<PinState> {
        self.transitions
            .borrow()
            .iter()
            .rev()
            .find(|(p, _)| *p == pin)
            .map(|(_, level)| *level)
    }
}

impl ValveDriver for RecordingDriver {
    fn configure(&self, pin: u32, direction: Direction) -> Result<()> {
        self.configured.borrow_mut().push((pin, direction));
        Ok(())
    }

    fn set(&self, pin: u32, level: PinState) -> Result<()> {
        if self.fail_on.get() == Some((pin, level)) {
            return Err(anyhow!("injected failure setting pin {pin}"));
        }
        self.transitions.borrow_mut().push((pin, level));
        Ok(())
    }
}

/// Operator log kept in memory, without timestamps.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: RefCell<Vec<(Level, String)>>,
}

impl MemoryLog {
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .borrow()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(Level, String)> {
        self.entries.borrow().clone()
    }
}

impl OperatorLog for MemoryLog {
    fn record(&self, level: Level, message: &str) {
        self.entries.borrow_mut().push((level, message.to_string()));
    }

    fn contents(&self) -> Result<String> {
        let mut buf = String::new();
        for (level, message) in self.entries.borrow().iter() {
            buf.push_str(&format!("2000-01-01 00:00:00 {}: {message}\n", level.as_str()));
        }
        Ok(buf)
    }
}

#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: RefCell<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.borrow().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .map(|event| event.tags.action.clone())
            .collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn emit(&self, event: &MetricEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

/// Pacer that never blocks. Records requested sleeps and can raise the stop
/// marker after a number of ticks.
#[derive(Debug, Default)]
pub struct ScriptedPacer<'a> {
    sleeps: RefCell<Vec<Duration>>,
    stop: Option<(&'a MemoryStore, usize)>,
    clock: Option<&'a MemoryStore>,
}

impl<'a> ScriptedPacer<'a> {
    pub fn new() -> Self {
        Self {
            sleeps: RefCell::new(Vec::new()),
            stop: None,
            clock: None,
        }
    }

    /// Advance `store`'s clock by every requested sleep.
    pub fn advancing(store: &'a MemoryStore) -> Self {
        Self {
            clock: Some(store),
            ..Self::new()
        }
    }

    /// Write the stop marker into `store` once `ticks` sleeps have happened.
    pub fn stop_after(store: &'a MemoryStore, ticks: usize) -> Self {
        Self {
            stop: Some((store, ticks)),
            ..Self::new()
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.sleeps.borrow().iter().sum()
    }
}

impl Pacer for ScriptedPacer<'_> {
    fn sleep(&self, duration: Duration) {
        let ticks = {
            let mut sleeps = self.sleeps.borrow_mut();
            sleeps.push(duration);
            sleeps.len()
        };
        if let Some(store) = self.clock {
            let step = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
            store.set_now(store.now.get() + step);
        }
        if let Some((store, after)) = self.stop {
            if ticks == after {
                store.insert(STOP_KEY, "");
            }
        }
    }
}
