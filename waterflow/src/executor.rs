//! Program Executor: drives relay sequences for a program or a single valve.
//!
//! Every sequence energizes the shared inverter relay first and always
//! de-energizes it last, even when a stop request or a driver error ends the
//! sequence early. Waits are cooperative: the stop marker is polled every
//! [`STOP_POLL_INTERVAL`] instead of sleeping through the whole duration.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use embedded_hal::digital::PinState;
use tracing::{debug, info, instrument};

use crate::core::types::{Program, RunReport, Trigger};
use crate::io::config::{ConfigInvalid, WaterflowConfig};
use crate::io::lock::ExecutionLock;
use crate::io::metrics::{MetricEvent, MetricsSink};
use crate::io::oplog::OperatorLog;
use crate::io::pacer::Pacer;
use crate::io::state::StateStore;
use crate::io::valve::ValveDriver;

/// How often a running valve re-checks the stop marker.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How an interruptible wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Stopped,
}

/// Cancellation token backed by the `stop` marker.
#[derive(Clone, Copy)]
pub struct StopToken<'a> {
    state: StateStore<'a>,
}

impl<'a> StopToken<'a> {
    pub fn new(state: StateStore<'a>) -> Self {
        Self { state }
    }

    pub fn is_cancelled(&self) -> Result<bool> {
        self.state.stop_requested()
    }
}

/// Wait for `total`, polling `stop` before every `tick`-sized sleep.
///
/// When `lease` is given, the lock marker is refreshed on every tick so an
/// overlapping invocation keeps seeing it as live.
pub fn interruptible_wait(
    total: Duration,
    tick: Duration,
    stop: &StopToken<'_>,
    lease: Option<&ExecutionLock<'_>>,
    pacer: &dyn Pacer,
) -> Result<WaitOutcome> {
    let mut waited = Duration::ZERO;
    while waited < total {
        if stop.is_cancelled()? {
            debug!(waited_secs = waited.as_secs(), "wait interrupted by stop request");
            return Ok(WaitOutcome::Stopped);
        }
        if let Some(lock) = lease {
            lock.refresh()?;
        }
        let step = tick.min(total - waited);
        pacer.sleep(step);
        waited += step;
    }
    Ok(WaitOutcome::Elapsed)
}

fn minutes(value: u32) -> Duration {
    Duration::from_secs(u64::from(value) * 60)
}

pub struct ProgramExecutor<'a> {
    config: &'a WaterflowConfig,
    driver: &'a dyn ValveDriver,
    log: &'a dyn OperatorLog,
    metrics: &'a dyn MetricsSink,
    pacer: &'a dyn Pacer,
    stop: StopToken<'a>,
    lease: Option<&'a ExecutionLock<'a>>,
    tick: Duration,
}

impl<'a> ProgramExecutor<'a> {
    pub fn new(
        config: &'a WaterflowConfig,
        driver: &'a dyn ValveDriver,
        log: &'a dyn OperatorLog,
        metrics: &'a dyn MetricsSink,
        pacer: &'a dyn Pacer,
        stop: StopToken<'a>,
    ) -> Self {
        Self {
            config,
            driver,
            log,
            metrics,
            pacer,
            stop,
            lease: None,
            tick: STOP_POLL_INTERVAL,
        }
    }

    /// Keep `lock` refreshed while valves are open.
    pub fn with_lease(mut self, lock: &'a ExecutionLock<'a>) -> Self {
        self.lease = Some(lock);
        self
    }

    /// Run each valve of `program` in index order for its configured minutes.
    ///
    /// Valves with a zero duration, and every valve once a stop is pending,
    /// are skipped.
    #[instrument(skip_all, fields(program = %program.name, forced = trigger.is_forced()))]
    pub fn run_program(&self, program: &Program, trigger: Trigger) -> Result<RunReport> {
        if program.valves_times.len() > self.config.valves.len() {
            return Err(ConfigInvalid {
                errors: vec![format!(
                    "program '{}' lists {} valve times but only {} valves are configured",
                    program.name,
                    program.valves_times.len(),
                    self.config.valves.len()
                )],
            }
            .into());
        }
        info!("executing program");
        self.log.info(&format!("Executing program {}.", program.name));

        self.set_inverter(PinState::High)?;
        let result = self.run_valves(program);
        let off = self.set_inverter(PinState::Low);
        let report = result?;
        off?;

        self.metrics.emit(&MetricEvent::action(
            format!("prog_{}", program.name),
            trigger.is_forced(),
            report.stopped,
        ));
        Ok(report)
    }

    /// Forced single-valve run, always bounded by `max_valve_time`.
    #[instrument(skip(self))]
    pub fn run_valve(&self, index: usize) -> Result<RunReport> {
        if index >= self.config.valves.len() {
            bail!(
                "valve {index} is not configured ({} valves)",
                self.config.valves.len()
            );
        }
        info!("executing forced valve");

        self.set_inverter(PinState::High)?;
        let result = self.open_valve(index, minutes(self.config.max_valve_time));
        let off = self.set_inverter(PinState::Low);
        let outcome = result?;
        off?;

        let report = RunReport {
            energized: vec![index],
            skipped: Vec::new(),
            stopped: outcome == WaitOutcome::Stopped,
        };
        self.metrics.emit(&MetricEvent::action(
            format!("valve{index}"),
            true,
            report.stopped,
        ));
        Ok(report)
    }

    fn run_valves(&self, program: &Program) -> Result<RunReport> {
        let mut report = RunReport::default();
        for (index, &valve_minutes) in program.valves_times.iter().enumerate() {
            let stop_pending = self.stop.is_cancelled()?;
            if valve_minutes == 0 || stop_pending {
                report.stopped |= stop_pending;
                debug!(valve = index, stop_pending, "valve skipped");
                self.log.info(&format!("Valve {index} Skipped."));
                report.skipped.push(index);
                continue;
            }
            let outcome = self.open_valve(index, minutes(valve_minutes))?;
            report.energized.push(index);
            report.stopped |= outcome == WaitOutcome::Stopped;
        }
        Ok(report)
    }

    /// Energize one valve for `duration`, de-energizing it however the wait ends.
    fn open_valve(&self, index: usize, duration: Duration) -> Result<WaitOutcome> {
        let pin = self
            .config
            .valves
            .get(index)
            .map(|valve| valve.pin)
            .with_context(|| format!("valve {index} is not configured"))?;

        self.driver.set(pin, PinState::High)?;
        self.log.info(&format!("Valve {index} ON."));

        let waited = interruptible_wait(duration, self.tick, &self.stop, self.lease, self.pacer);
        let off = self.driver.set(pin, PinState::Low);
        if off.is_ok() {
            self.log.info(&format!("Valve {index} OFF."));
        }
        let outcome = waited?;
        off?;
        Ok(outcome)
    }

    fn set_inverter(&self, level: PinState) -> Result<()> {
        self.driver.set(self.config.inverter_relay_pin, level)?;
        let label = match level {
            PinState::High => "ON",
            PinState::Low => "OFF",
        };
        self.log.info(&format!("Inverter relay {label}."));
        Ok(())
    }
}
