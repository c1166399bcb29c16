//! Valve driver capability.
//!
//! The controller never selects a hardware API; it only configures pins and
//! sets their level through [`ValveDriver`]. Two implementations exist and are
//! selected by the `driver` config key:
//!
//! - [`SimulatedValveDriver`]: tracks levels in memory (dry runs, dev hosts).
//! - [`SysfsValveDriver`]: drives Linux GPIO lines via `/sys/class/gpio`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use embedded_hal::digital::{self, ErrorKind, ErrorType, OutputPin, PinState};
use tracing::{debug, info};

use crate::io::config::{DriverKind, WaterflowConfig};

/// Pin direction for [`ValveDriver::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Physical actuation capability for relay pins.
pub trait ValveDriver {
    fn configure(&self, pin: u32, direction: Direction) -> Result<()>;
    fn set(&self, pin: u32, level: PinState) -> Result<()>;
}

/// Build the driver named by the config.
pub fn driver_from_config(cfg: &WaterflowConfig) -> Box<dyn ValveDriver> {
    match cfg.driver {
        DriverKind::Simulated => Box::new(SimulatedValveDriver::default()),
        DriverKind::Sysfs => Box::new(SysfsValveDriver::new(&cfg.gpio_root)),
    }
}

/// Driver that only records pin levels.
#[derive(Debug, Default)]
pub struct SimulatedValveDriver {
    levels: RefCell<BTreeMap<u32, PinState>>,
}

impl SimulatedValveDriver {
    pub fn level(&self, pin: u32) -> Option<PinState> {
        self.levels.borrow().get(&pin).copied()
    }
}

impl ValveDriver for SimulatedValveDriver {
    fn configure(&self, pin: u32, direction: Direction) -> Result<()> {
        debug!(pin, ?direction, "simulated pin configured");
        if direction == Direction::Output {
            self.levels.borrow_mut().insert(pin, PinState::Low);
        }
        Ok(())
    }

    fn set(&self, pin: u32, level: PinState) -> Result<()> {
        info!(pin, ?level, "simulated pin set");
        self.levels.borrow_mut().insert(pin, level);
        Ok(())
    }
}

/// Driver for Linux GPIO lines exposed through sysfs.
#[derive(Debug, Clone)]
pub struct SysfsValveDriver {
    root: PathBuf,
}

impl SysfsValveDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn export(&self, line: u32) -> Result<()> {
        if self.root.join(format!("gpio{line}")).exists() {
            return Ok(());
        }
        let export = self.root.join("export");
        fs::write(&export, line.to_string())
            .with_context(|| format!("export gpio {line} via {}", export.display()))
    }
}

impl ValveDriver for SysfsValveDriver {
    fn configure(&self, pin: u32, direction: Direction) -> Result<()> {
        self.export(pin)?;
        let path = self.root.join(format!("gpio{pin}")).join("direction");
        let value = match direction {
            Direction::Input => "in",
            // "low" sets output mode with the line already driven low.
            Direction::Output => "low",
        };
        debug!(pin, value, "configuring gpio direction");
        fs::write(&path, value).with_context(|| format!("write {}", path.display()))
    }

    fn set(&self, pin: u32, level: PinState) -> Result<()> {
        let mut line = SysfsPin::new(&self.root, pin);
        line.set_state(level)
            .with_context(|| format!("set gpio {pin} {level:?}"))
    }
}

/// A single exported sysfs GPIO line used as an output.
#[derive(Debug)]
pub struct SysfsPin {
    value_path: PathBuf,
}

impl SysfsPin {
    pub fn new(root: &Path, line: u32) -> Self {
        Self {
            value_path: root.join(format!("gpio{line}")).join("value"),
        }
    }

    fn write_value(&mut self, value: &str) -> Result<(), SysfsPinError> {
        fs::write(&self.value_path, value).map_err(|source| SysfsPinError {
            path: self.value_path.clone(),
            source,
        })
    }
}

#[derive(Debug)]
pub struct SysfsPinError {
    path: PathBuf,
    source: io::Error,
}

impl fmt::Display for SysfsPinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write {}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for SysfsPinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl digital::Error for SysfsPinError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

impl ErrorType for SysfsPin {
    type Error = SysfsPinError;
}

impl OutputPin for SysfsPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write_value("0")
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write_value("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(root: &Path, lines: &[u32]) {
        fs::write(root.join("export"), "").expect("export file");
        for line in lines {
            fs::create_dir_all(root.join(format!("gpio{line}"))).expect("line dir");
        }
    }

    #[test]
    fn sysfs_driver_writes_direction_and_value() {
        let temp = tempfile::tempdir().expect("tempdir");
        fake_sysfs(temp.path(), &[17]);
        let driver = SysfsValveDriver::new(temp.path());

        driver.configure(17, Direction::Output).expect("configure");
        driver.set(17, PinState::High).expect("set high");
        let line = temp.path().join("gpio17");
        assert_eq!(fs::read_to_string(line.join("direction")).expect("dir"), "low");
        assert_eq!(fs::read_to_string(line.join("value")).expect("value"), "1");

        driver.set(17, PinState::Low).expect("set low");
        assert_eq!(fs::read_to_string(line.join("value")).expect("value"), "0");
    }

    #[test]
    fn sysfs_driver_exports_missing_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        fake_sysfs(temp.path(), &[]);
        let driver = SysfsValveDriver::new(temp.path());

        // The fake tree has no kernel behind it, so the direction write fails
        // after the export request is recorded.
        assert!(driver.configure(4, Direction::Input).is_err());
        assert_eq!(fs::read_to_string(temp.path().join("export")).expect("export"), "4");
    }

    #[test]
    fn simulated_driver_tracks_levels() {
        let driver = SimulatedValveDriver::default();
        assert_eq!(driver.level(3), None);
        driver.configure(3, Direction::Output).expect("configure");
        assert_eq!(driver.level(3), Some(PinState::Low));
        driver.set(3, PinState::High).expect("set");
        assert_eq!(driver.level(3), Some(PinState::High));
    }

    #[test]
    fn driver_kind_selects_implementation() {
        let cfg = WaterflowConfig::default();
        let driver = driver_from_config(&cfg);
        driver.configure(cfg.inverter_relay_pin, Direction::Output).expect("configure");
    }
}
