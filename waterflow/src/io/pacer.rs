//! Blocking sleep capability for actuation waits.

use std::thread;
use std::time::Duration;

/// Blocks the invocation for a short interval.
///
/// Actuation waits are built from many short `sleep` calls so a stop request
/// is observed between them.
pub trait Pacer {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
