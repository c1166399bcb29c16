//! Controller configuration stored as TOML (default `~/.config/waterflow/config.toml`).

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::core::types::{Program, Valve};

/// Which valve driver implementation actuates the relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Track pin levels in memory only (dry runs, development hosts).
    Simulated,
    /// Drive Linux GPIO lines through sysfs.
    Sysfs,
}

/// Controller configuration (TOML).
///
/// Missing fields default to a two-valve, two-program simulated setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WaterflowConfig {
    /// Longest expected loop invocation, in minutes. Bounds the lock age and
    /// the window in which a due program may still start.
    pub max_loop_time: u32,

    /// Ceiling in minutes for a forced single-valve run.
    pub max_valve_time: u32,

    /// Emit action metrics to `metrics.jsonl`.
    pub metrics: bool,

    pub driver: DriverKind,

    /// Root of the sysfs GPIO tree (only used by the `sysfs` driver).
    pub gpio_root: PathBuf,

    /// Relay that powers the valves (inverter / shared supply).
    pub inverter_relay_pin: u32,

    /// Input that reports external AC presence. Configured but not acted upon.
    pub external_ac_signal_pin: Option<u32>,

    pub valves: Vec<Valve>,

    pub programs: Vec<Program>,
}

impl Default for WaterflowConfig {
    fn default() -> Self {
        Self {
            max_loop_time: 10,
            max_valve_time: 10,
            metrics: false,
            driver: DriverKind::Simulated,
            gpio_root: PathBuf::from("/sys/class/gpio"),
            inverter_relay_pin: 18,
            external_ac_signal_pin: None,
            valves: vec![Valve { pin: 23 }, Valve { pin: 24 }],
            programs: vec![
                Program {
                    name: "first".to_string(),
                    start_time: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
                    enabled: false,
                    valves_times: vec![10, 10],
                },
                Program {
                    name: "second".to_string(),
                    start_time: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default(),
                    enabled: false,
                    valves_times: vec![10, 10],
                },
            ],
        }
    }
}

/// Configuration rejected by [`WaterflowConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigInvalid {
    pub errors: Vec<String>,
}

impl fmt::Display for ConfigInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid config:\n- {}", self.errors.join("\n- "))
    }
}

impl std::error::Error for ConfigInvalid {}

impl WaterflowConfig {
    /// Check cross-field invariants. Must pass before any relay is energized.
    pub fn validate(&self) -> Result<(), ConfigInvalid> {
        let mut errors = Vec::new();
        if self.max_loop_time == 0 {
            errors.push("max_loop_time must be > 0".to_string());
        }
        if self.max_valve_time == 0 {
            errors.push("max_valve_time must be > 0".to_string());
        }
        if self.valves.is_empty() {
            errors.push("valves must not be empty".to_string());
        }

        let mut pins = HashSet::new();
        pins.insert(self.inverter_relay_pin);
        if let Some(pin) = self.external_ac_signal_pin {
            if !pins.insert(pin) {
                errors.push(format!("external_ac_signal_pin {pin} is already in use"));
            }
        }
        for (index, valve) in self.valves.iter().enumerate() {
            if !pins.insert(valve.pin) {
                errors.push(format!("valve {index} pin {} is already in use", valve.pin));
            }
        }

        let mut names = HashSet::new();
        for (index, program) in self.programs.iter().enumerate() {
            if program.name.trim().is_empty() {
                errors.push(format!("program {index} has an empty name"));
            } else if !names.insert(program.name.as_str()) {
                errors.push(format!("duplicate program name '{}'", program.name));
            }
            if program.valves_times.len() > self.valves.len() {
                errors.push(format!(
                    "program '{}' lists {} valve times but only {} valves are configured",
                    program.name,
                    program.valves_times.len(),
                    self.valves.len()
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigInvalid { errors })
        }
    }

    pub fn max_loop_delta(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.max_loop_time))
    }

    pub fn max_valve_delta(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.max_valve_time))
    }

    pub fn program_index(&self, name: &str) -> Option<usize> {
        self.programs.iter().position(|program| program.name == name)
    }

    /// Every pin driven as an output: the inverter relay then each valve.
    pub fn output_pins(&self) -> Vec<u32> {
        std::iter::once(self.inverter_relay_pin)
            .chain(self.valves.iter().map(|valve| valve.pin))
            .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WaterflowConfig::default()`.
pub fn load_config(path: &Path) -> Result<WaterflowConfig> {
    if !path.exists() {
        let cfg = WaterflowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WaterflowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WaterflowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Changes to apply to one program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramEdit {
    pub start_time: Option<NaiveTime>,
    pub enabled: Option<bool>,
    pub valves_times: Option<Vec<u32>>,
}

/// Apply `edit` to the named program and persist the result.
pub fn update_program(
    path: &Path,
    cfg: &mut WaterflowConfig,
    name: &str,
    edit: &ProgramEdit,
) -> Result<()> {
    let index = cfg
        .program_index(name)
        .with_context(|| format!("unknown program '{name}'"))?;
    let program = &mut cfg.programs[index];
    if let Some(start_time) = edit.start_time {
        program.start_time = start_time;
    }
    if let Some(enabled) = edit.enabled {
        program.enabled = enabled;
    }
    if let Some(valves_times) = &edit.valves_times {
        program.valves_times = valves_times.clone();
    }
    write_config(path, cfg)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, WaterflowConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = WaterflowConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn parses_hand_written_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
max_loop_time = 15
max_valve_time = 20
metrics = true
driver = "sysfs"
inverter_relay_pin = 5

[[valves]]
pin = 6

[[valves]]
pin = 13

[[programs]]
name = "first"
start_time = "23:30:00"
enabled = true
valves_times = [10, 0]
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_loop_time, 15);
        assert_eq!(cfg.driver, DriverKind::Sysfs);
        assert_eq!(cfg.gpio_root, PathBuf::from("/sys/class/gpio"));
        assert_eq!(cfg.output_pins(), vec![5, 6, 13]);
        assert_eq!(cfg.programs.len(), 1);
        assert_eq!(
            cfg.programs[0].start_time,
            NaiveTime::from_hms_opt(23, 30, 0).expect("time")
        );
        assert_eq!(cfg.max_loop_delta(), TimeDelta::minutes(15));
    }

    #[test]
    fn validate_reports_every_violation() {
        let mut cfg = WaterflowConfig::default();
        cfg.max_loop_time = 0;
        cfg.valves[1].pin = cfg.inverter_relay_pin;
        cfg.programs[1].name = cfg.programs[0].name.clone();
        cfg.programs[0].valves_times = vec![1, 2, 3];

        let err = cfg.validate().unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("max_loop_time")));
        assert!(err.errors.iter().any(|e| e.contains("already in use")));
        assert!(err.errors.iter().any(|e| e.contains("duplicate program name")));
        assert!(err.errors.iter().any(|e| e.contains("3 valve times")));
    }

    #[test]
    fn update_program_persists_edit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = WaterflowConfig::default();
        write_config(&path, &cfg).expect("write");

        let edit = ProgramEdit {
            start_time: NaiveTime::from_hms_opt(6, 30, 0),
            enabled: Some(true),
            valves_times: Some(vec![5, 0]),
        };
        update_program(&path, &mut cfg, "second", &edit).expect("update");

        let loaded = load_config(&path).expect("load");
        let second = &loaded.programs[1];
        assert!(second.enabled);
        assert_eq!(second.valves_times, vec![5, 0]);
        assert_eq!(second.start_time, NaiveTime::from_hms_opt(6, 30, 0).expect("time"));
    }

    #[test]
    fn update_unknown_program_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = WaterflowConfig::default();
        let err = update_program(&path, &mut cfg, "missing", &ProgramEdit::default()).unwrap_err();
        assert!(err.to_string().contains("unknown program"));
    }
}
