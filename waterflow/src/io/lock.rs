//! Cross-invocation mutual exclusion backed by the `lock` marker.
//!
//! The lock is a plain marker rather than a database or network lock so the
//! control loop keeps working with nothing but a local filesystem. A marker
//! older than `max_loop_time` belongs to a crashed holder and is reclaimed.
//! A holder refreshes the marker while it waits, so a long run never looks
//! stale. Ages are measured on the store's own clock, the one that stamps
//! the marker, never on the instant the schedule is evaluated for.

use std::fmt;

use anyhow::Result;
use chrono::TimeDelta;
use tracing::{debug, warn};

use crate::io::state::LOCK_KEY;
use crate::io::store::MarkerStore;

/// Result of trying to take the execution lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    /// No marker existed; a fresh one was created.
    Acquired,
    /// A stale marker was found and refreshed.
    Reclaimed { age: TimeDelta },
    /// A live marker is held by another invocation.
    Busy,
}

impl LockAcquire {
    pub fn is_held(self) -> bool {
        !matches!(self, LockAcquire::Busy)
    }
}

/// Raised when releasing a lock whose marker is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockNotHeld;

impl fmt::Display for LockNotHeld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution lock was not held at release")
    }
}

impl std::error::Error for LockNotHeld {}

pub struct ExecutionLock<'a> {
    store: &'a dyn MarkerStore,
    max_loop_time: TimeDelta,
}

impl<'a> ExecutionLock<'a> {
    pub fn new(store: &'a dyn MarkerStore, max_loop_time: TimeDelta) -> Self {
        Self {
            store,
            max_loop_time,
        }
    }

    pub fn acquire(&self) -> Result<LockAcquire> {
        if self.store.create(LOCK_KEY)? {
            debug!("execution lock acquired");
            return Ok(LockAcquire::Acquired);
        }
        let Some(modified) = self.store.modified_at(LOCK_KEY)? else {
            // Released between the create attempt and the stat.
            return Ok(if self.store.create(LOCK_KEY)? {
                LockAcquire::Acquired
            } else {
                LockAcquire::Busy
            });
        };
        let age = self.store.now() - modified;
        if age > self.max_loop_time {
            warn!(age_secs = age.num_seconds(), "reclaiming stale execution lock");
            self.store.write(LOCK_KEY, "")?;
            return Ok(LockAcquire::Reclaimed { age });
        }
        debug!(age_secs = age.num_seconds(), "execution lock busy");
        Ok(LockAcquire::Busy)
    }

    /// Touch the marker so a held lock stays live during a long run.
    pub fn refresh(&self) -> Result<()> {
        debug!("execution lock refreshed");
        self.store.write(LOCK_KEY, "")
    }

    /// Remove the lock marker.
    ///
    /// Fails with [`LockNotHeld`] if the marker was already absent.
    pub fn release(&self) -> Result<()> {
        if self.store.remove(LOCK_KEY)? {
            debug!("execution lock released");
            return Ok(());
        }
        Err(LockNotHeld.into())
    }
}
