//! Irrigation valve scheduler and controller.
//!
//! A short-lived loop invocation is started periodically (e.g. every minute by
//! cron). Each invocation takes a file-marker lock, honours pending stop and
//! force requests or runs the next due program, then touches a heartbeat.
//!
//! - **[`core`]**: Pure, deterministic logic (schedule resolution, execution
//!   window, loop health). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (markers, config, GPIO relays, logs,
//!   metrics, pacing). Behind traits so tests run against in-memory fakes.
//!
//! Orchestration modules ([`controller`], [`executor`], [`operator`]) combine
//! the two to implement CLI commands.

pub mod controller;
pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod operator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
