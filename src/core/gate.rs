// src/core/gate.rs

//! A reusable "disable-with-timeout / in-progress" latch, the sole
//! admission-control mechanism for recovery and takeover runs.
//!
//! No code path may start a recovery or takeover run while its gate is
//! disabled or already in progress.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::errors::{RecoverdError, Result};

#[derive(Debug, Default)]
struct GateInner {
    in_progress: bool,
    /// A live timer handle means the gate is disabled; dropping/aborting it
    /// re-enables the gate.
    disable_timer: Option<JoinHandle<()>>,
}

/// An `OperationGate` guards a single coarse operation class (recovery,
/// takeover run) so that at most one instance of it runs at a time, and so
/// that it can be temporarily disabled (e.g. while an election settles).
#[derive(Debug, Clone, Default)]
pub struct OperationGate {
    name: &'static str,
    inner: Arc<Mutex<GateInner>>,
}

impl OperationGate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(GateInner::default())),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.inner.lock().in_progress
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disable_timer.is_some()
    }

    /// Begins the operation. Fails if the gate is disabled; returns `true` on
    /// success and marks the gate in-progress.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.disable_timer.is_some() {
            return Err(RecoverdError::GateDisabled);
        }
        if inner.in_progress {
            return Err(RecoverdError::GateInProgress);
        }
        inner.in_progress = true;
        debug!(gate = self.name, "begin");
        Ok(())
    }

    pub fn end(&self) {
        let mut inner = self.inner.lock();
        inner.in_progress = false;
        debug!(gate = self.name, "end");
    }

    /// `disable(0)` is equivalent to `enable()`. `disable(t > 0)` fails with
    /// `GateInProgress` if the gate is currently in progress; otherwise it
    /// (re)arms a timer that calls `enable()` after `t` seconds, cancelling
    /// any previously armed timer.
    pub fn disable(&self, timeout_seconds: u64) -> Result<()> {
        if timeout_seconds == 0 {
            self.enable();
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.in_progress {
            return Err(RecoverdError::GateInProgress);
        }
        if let Some(old) = inner.disable_timer.take() {
            old.abort();
        }
        let inner_arc = self.inner.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_seconds)).await;
            let mut inner = inner_arc.lock();
            inner.disable_timer = None;
            debug!(gate = name, "disable timer elapsed, re-enabled");
        });
        inner.disable_timer = Some(handle);
        debug!(gate = self.name, timeout_seconds, "disabled");
        Ok(())
    }

    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.disable_timer.take() {
            old.abort();
        }
        debug!(gate = self.name, "enabled");
    }
}

impl Drop for GateInner {
    fn drop(&mut self) {
        if let Some(t) = self.disable_timer.take() {
            t.abort();
        }
    }
}

/// RAII guard returned by [`GateGuard::acquire`]; calls `end()` on drop so the
/// gate is released on every return path, including early returns and
/// unwinding through `?`.
pub struct GateGuard {
    gate: OperationGate,
}

impl GateGuard {
    pub fn acquire(gate: &OperationGate) -> Result<Self> {
        gate.begin()?;
        Ok(Self { gate: gate.clone() })
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_end_roundtrip() {
        let gate = OperationGate::new("test");
        assert!(!gate.is_in_progress());
        gate.begin().unwrap();
        assert!(gate.is_in_progress());
        gate.end();
        assert!(!gate.is_in_progress());
    }

    #[test]
    fn begin_twice_fails() {
        let gate = OperationGate::new("test");
        gate.begin().unwrap();
        assert!(matches!(gate.begin(), Err(RecoverdError::GateInProgress)));
    }

    #[test]
    fn disable_zero_is_noop_enable() {
        let gate = OperationGate::new("test");
        gate.disable(0).unwrap();
        assert!(!gate.is_disabled());
    }

    #[test]
    fn disable_while_in_progress_fails() {
        let gate = OperationGate::new("test");
        gate.begin().unwrap();
        assert!(matches!(
            gate.disable(5),
            Err(RecoverdError::GateInProgress)
        ));
    }

    #[test]
    fn guard_releases_on_drop() {
        let gate = OperationGate::new("test");
        {
            let _guard = GateGuard::acquire(&gate).unwrap();
            assert!(gate.is_in_progress());
        }
        assert!(!gate.is_in_progress());
    }

    #[tokio::test]
    async fn disable_blocks_begin_until_timer_fires() {
        let gate = OperationGate::new("test");
        gate.disable(1).unwrap();
        assert!(matches!(gate.begin(), Err(RecoverdError::GateDisabled)));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!gate.is_disabled());
        gate.begin().unwrap();
    }
}
