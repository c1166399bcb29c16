//! Loop Controller: one periodic invocation of the irrigation loop.
//!
//! An invocation acquires the execution lock, consumes a pending stop or force
//! request or evaluates the schedule, advances the last-execution marker once
//! the decision is final, logs the next program, and touches the heartbeat.
//! The lock is released and every output relay is driven low on the way out,
//! whether the invocation succeeded or failed.

use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use embedded_hal::digital::PinState;
use tracing::{debug, error, info, warn};

use crate::core::schedule::resolve;
use crate::core::types::{ForceKind, ForceRequest, LoopOutcome, Program, RunReport, Trigger};
use crate::core::window::{SlotDecision, decide};
use crate::executor::{ProgramExecutor, StopToken};
use crate::io::config::WaterflowConfig;
use crate::io::lock::{ExecutionLock, LockAcquire};
use crate::io::metrics::{MetricEvent, MetricsSink};
use crate::io::oplog::OperatorLog;
use crate::io::pacer::Pacer;
use crate::io::state::{LastExecution, StateStore};
use crate::io::store::MarkerStore;
use crate::io::valve::{Direction, ValveDriver};
use crate::operator::next_program_message;

/// Hook that may veto a due scheduled program (e.g. soil already wet).
///
/// A vetoed program still consumes its slot.
pub trait SkipPolicy {
    fn should_skip(&self, program: &Program) -> bool;
}

/// Default policy: run every due program.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkip;

impl SkipPolicy for NeverSkip {
    fn should_skip(&self, _program: &Program) -> bool {
        false
    }
}

/// Everything one invocation needs, passed explicitly.
pub struct LoopContext<'a> {
    pub config: &'a WaterflowConfig,
    pub store: &'a dyn MarkerStore,
    pub driver: &'a dyn ValveDriver,
    pub log: &'a dyn OperatorLog,
    pub metrics: &'a dyn MetricsSink,
    pub pacer: &'a dyn Pacer,
    pub skip: &'a dyn SkipPolicy,
}

/// Run one loop invocation at `now` (local wall-clock time).
///
/// Errors raised after the lock is taken are logged to both sinks and then
/// returned, after the lock has been released.
pub fn run_loop<Tz>(ctx: &LoopContext<'_>, now: &DateTime<Tz>) -> Result<LoopOutcome>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if let Err(invalid) = ctx.config.validate() {
        error!(err = %invalid, "refusing to loop with invalid config");
        ctx.log.error(&format!("Exception looping: {invalid}"));
        return Err(invalid.into());
    }

    let now_utc = now.with_timezone(&Utc);
    let lock = ExecutionLock::new(ctx.store, ctx.config.max_loop_delta());
    match lock.acquire()? {
        LockAcquire::Busy => {
            debug!("loop executed while locked by previous execution");
            return Ok(LoopOutcome::LockBusy);
        }
        LockAcquire::Reclaimed { age } => {
            warn!(age_secs = age.num_seconds(), "lock expired, last loop ended abnormally?");
            ctx.log.warning("Lock expired: Last loop ended abnormally?.");
        }
        LockAcquire::Acquired => {}
    }
    let _held = HeldLock {
        lock: &lock,
        log: ctx.log,
    };

    let result = run_locked(ctx, &lock, now, now_utc);
    if let Err(err) = &result {
        error!(err = %format!("{err:#}"), "exception looping");
        ctx.log.error(&format!("Exception looping: {err:#}"));
    }
    result
}

fn run_locked<Tz>(
    ctx: &LoopContext<'_>,
    lock: &ExecutionLock<'_>,
    now: &DateTime<Tz>,
    now_utc: DateTime<Utc>,
) -> Result<LoopOutcome>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let state = StateStore::new(ctx.store);
    let force = read_force_request(ctx, &state)?;

    let outcome = if state.stop_requested()? {
        info!("loop skipped (stop request)");
        ctx.log.info("Activity stopped.");
        ctx.metrics.emit(&MetricEvent::action("Stop", true, false));
        if force.is_some() {
            state.clear_force_request()?;
        }
        state.clear_stop_request()?;
        LoopOutcome::Stopped
    } else {
        debug!("looping");
        let relays = RelayCleanup::setup(ctx.config, ctx.driver)?;
        let executor = ProgramExecutor::new(
            ctx.config,
            ctx.driver,
            ctx.log,
            ctx.metrics,
            ctx.pacer,
            StopToken::new(state),
        )
        .with_lease(lock);
        let outcome = match force {
            Some(request) => run_forced(ctx, &state, &executor, request, now_utc),
            None => run_scheduled(ctx, &state, &executor, now, now_utc),
        };
        drop(relays);
        outcome?
    };

    log_next_program(ctx, &state, now)?;
    state.touch_heartbeat()?;
    Ok(outcome)
}

/// Pending force request. An unreadable marker is logged and discarded.
fn read_force_request(
    ctx: &LoopContext<'_>,
    state: &StateStore<'_>,
) -> Result<Option<ForceRequest>> {
    match state.force_request() {
        Ok(request) => Ok(request),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "discarding unreadable force request");
            ctx.log
                .warning(&format!("Discarding unreadable force request: {err:#}"));
            state.clear_force_request()?;
            Ok(None)
        }
    }
}

fn run_forced(
    ctx: &LoopContext<'_>,
    state: &StateStore<'_>,
    executor: &ProgramExecutor<'_>,
    request: ForceRequest,
    now_utc: DateTime<Utc>,
) -> Result<LoopOutcome> {
    let result = execute_forced(ctx, state, executor, request, now_utc);
    // A force request is consumed even when its execution failed.
    let cleared = state.clear_force_request();
    let report = result?;
    cleared?;
    Ok(LoopOutcome::ForcedExecuted { request, report })
}

fn execute_forced(
    ctx: &LoopContext<'_>,
    state: &StateStore<'_>,
    executor: &ProgramExecutor<'_>,
    request: ForceRequest,
    now_utc: DateTime<Utc>,
) -> Result<RunReport> {
    match request.kind {
        ForceKind::Program => {
            let program = ctx
                .config
                .programs
                .get(request.value)
                .with_context(|| format!("forced program {} is not configured", request.value))?;
            info!(program = %program.name, "forced program");
            ctx.log
                .info(&format!("Forced program {} executing now.", program.name));
            let report = executor.run_program(program, Trigger::Forced)?;
            state.write_last_execution(now_utc)?;
            Ok(report)
        }
        ForceKind::Valve => {
            info!(valve = request.value, "forced valve");
            ctx.log
                .info(&format!("Forced valve {} executing now.", request.value));
            executor.run_valve(request.value)
        }
    }
}

fn run_scheduled<Tz>(
    ctx: &LoopContext<'_>,
    state: &StateStore<'_>,
    executor: &ProgramExecutor<'_>,
    now: &DateTime<Tz>,
    now_utc: DateTime<Utc>,
) -> Result<LoopOutcome>
where
    Tz: TimeZone,
{
    let last = state.read_last_execution(now_utc)?;
    match &last {
        LastExecution::Recorded(_) => {}
        LastExecution::Initialized(at) => {
            info!(last_execution = %at, "no last execution recorded, starting from now");
        }
        LastExecution::Reset { at, error } => {
            warn!(last_execution = %at, %error, "last execution unreadable, reset to now");
            ctx.log.warning(&format!(
                "Last program time unreadable ({error}); waiting for the next program."
            ));
        }
    }

    let Some(due) = resolve(&ctx.config.programs, last.at(), now) else {
        debug!("no enabled program");
        return Ok(LoopOutcome::NoActiveProgram);
    };
    let program = &ctx.config.programs[due.index];
    let skip = now_utc >= due.due && ctx.skip.should_skip(program);
    let decision = decide(now_utc, due.due, ctx.config.max_loop_delta(), skip);
    debug!(program = %due.name, due = %due.due, ?decision, "scheduled slot evaluated");

    let outcome = match decision {
        SlotDecision::Wait => {
            return Ok(LoopOutcome::Waiting {
                program: due.name,
                due: due.due,
            });
        }
        SlotDecision::Run => {
            let report = executor.run_program(program, Trigger::Scheduled)?;
            LoopOutcome::ScheduledExecuted {
                program: due.name,
                due: due.due,
                report,
            }
        }
        SlotDecision::Skip(reason) => {
            info!(program = %due.name, ?reason, "scheduled program skipped");
            ctx.log
                .info(&format!("Program {} skipped ({reason:?}).", due.name));
            LoopOutcome::ScheduledSkipped {
                program: due.name,
                due: due.due,
                reason,
            }
        }
    };
    state.write_last_execution(now_utc)?;
    Ok(outcome)
}

/// Log the next due program unless the operator log already ends with it.
fn log_next_program<Tz>(
    ctx: &LoopContext<'_>,
    state: &StateStore<'_>,
    now: &DateTime<Tz>,
) -> Result<()>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let message = next_program_message(ctx.config, state, now)?;
    let previous = match ctx.log.last_message() {
        Ok(previous) => previous,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "cannot read operator log for dedup");
            None
        }
    };
    if previous.as_deref() != Some(message.as_str()) {
        ctx.log.info(&message);
    }
    Ok(())
}

/// Releases the execution lock when the invocation ends.
struct HeldLock<'a> {
    lock: &'a ExecutionLock<'a>,
    log: &'a dyn OperatorLog,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            error!(err = %err, "could not release lock");
            self.log.error("Could not release lock.");
        }
    }
}

/// Configures relay pins and drives every output low when dropped.
struct RelayCleanup<'a> {
    driver: &'a dyn ValveDriver,
    outputs: Vec<u32>,
}

impl<'a> RelayCleanup<'a> {
    fn setup(config: &WaterflowConfig, driver: &'a dyn ValveDriver) -> Result<Self> {
        // Armed before configuring so a partial setup is still cleaned up.
        let cleanup = Self {
            driver,
            outputs: config.output_pins(),
        };
        for &pin in &cleanup.outputs {
            driver.configure(pin, Direction::Output)?;
            driver.set(pin, PinState::Low)?;
        }
        if let Some(pin) = config.external_ac_signal_pin {
            driver.configure(pin, Direction::Input)?;
        }
        Ok(cleanup)
    }
}

impl Drop for RelayCleanup<'_> {
    fn drop(&mut self) {
        for &pin in &self.outputs {
            if let Err(err) = self.driver.set(pin, PinState::Low) {
                warn!(pin, err = %format!("{err:#}"), "relay cleanup failed");
            }
        }
    }
}
