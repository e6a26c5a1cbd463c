//! Runtime State: the per-execution ambient (spec §4.8).
//!
//! Per spec §9's design note, the thread-local global is replaced by
//! explicit context passed through resume entrypoints — this crate goes one
//! step further and never introduces a thread-local at all, which keeps the
//! ambient trivially snapshot-able and makes tests deterministic.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;

use crate::error::{EngineError, TimeoutError};
use crate::value::RuntimeValue;

/// Opaque token identifying an event loop / execution context, as returned
/// by `Scheduler::thread_context()` (spec §6).
pub type ContextToken = u64;

/// Host-provided I/O collaborator (stdin/stdout/etc.) — an external
/// collaborator per spec §1, modeled here only as the minimal trait the
/// core needs to snapshot and re-install.
pub trait IoHandles: std::fmt::Debug {
    fn write_out(&self, text: &str);
}

#[derive(Debug, Default)]
pub struct NullIoHandles;
impl IoHandles for NullIoHandles {
    fn write_out(&self, _text: &str) {}
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Tunable loop-timeout policy (spec §4.8). Built with a small
/// builder, matching the teacher's plain-struct-with-`with_*` convention
/// rather than a config-file loader — nothing in this spec implies an
/// external config format.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub max_loop_iterations: u64,
    pub deadline_check_every_n_iterations: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 1_000_000,
            deadline_check_every_n_iterations: 100,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_loop_iterations(mut self, n: u64) -> Self {
        self.max_loop_iterations = n;
        self
    }

    pub fn with_deadline_check_every_n_iterations(mut self, n: u64) -> Self {
        self.deadline_check_every_n_iterations = n;
        self
    }
}

/// A point-in-time capture of the ambient, carried by an `AsyncTask` so it
/// can be re-installed on whichever thread resumes (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct RuntimeStateSnapshot {
    pub context: Option<ContextToken>,
    pub globals: IndexMap<String, RuntimeValue>,
    pub loop_iteration_count: u64,
    pub deadline_ms: Option<i64>,
}

/// The live per-execution ambient (spec §4.8).
pub struct RuntimeState {
    pub config: RuntimeConfig,
    pub context: Cell<Option<ContextToken>>,
    pub globals: RefCell<IndexMap<String, RuntimeValue>>,
    pub io: RefCell<Rc<dyn IoHandles>>,
    iteration_count: Cell<u64>,
    pub deadline_ms: Cell<Option<i64>>,
}

impl RuntimeState {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            context: Cell::new(None),
            globals: RefCell::new(IndexMap::new()),
            io: RefCell::new(Rc::new(NullIoHandles)),
            iteration_count: Cell::new(0),
            deadline_ms: Cell::new(None),
        }
    }

    pub fn snapshot(&self) -> RuntimeStateSnapshot {
        RuntimeStateSnapshot {
            context: self.context.get(),
            globals: self.globals.borrow().clone(),
            loop_iteration_count: self.iteration_count.get(),
            deadline_ms: self.deadline_ms.get(),
        }
    }

    /// Re-installs a previously captured snapshot, e.g. before resuming on
    /// a different thread/task.
    pub fn restore_snapshot(&self, snap: &RuntimeStateSnapshot) {
        self.context.set(snap.context);
        *self.globals.borrow_mut() = snap.globals.clone();
        self.iteration_count.set(snap.loop_iteration_count);
        self.deadline_ms.set(snap.deadline_ms);
    }

    /// Invoked by user code at each loop head (spec §4.8). Raises
    /// `TimeoutError` if the iteration count exceeds the configured
    /// maximum, or — every K-th iteration — if the wall-clock deadline has
    /// expired.
    pub fn update_iteration_count(
        &self,
        source_id: &str,
        offset: u32,
    ) -> Result<(), EngineError> {
        let count = self.iteration_count.get() + 1;
        self.iteration_count.set(count);

        if count > self.config.max_loop_iterations {
            return Err(EngineError::Timeout(TimeoutError {
                reason: format!(
                    "loop exceeded max_loop_iterations ({})",
                    self.config.max_loop_iterations
                ),
                source_id: source_id.to_string(),
                offset,
            }));
        }

        if count % self.config.deadline_check_every_n_iterations == 0 {
            if let Some(deadline) = self.deadline_ms.get() {
                if now_ms() >= deadline {
                    return Err(EngineError::Timeout(TimeoutError {
                        reason: "wall-clock deadline expired".to_string(),
                        source_id: source_id.to_string(),
                        offset,
                    }));
                }
            }
        }

        Ok(())
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeding_max_iterations_times_out() {
        let state = RuntimeState::new(RuntimeConfig::new().with_max_loop_iterations(3));
        for _ in 0..3 {
            state.update_iteration_count("test", 0).unwrap();
        }
        let err = state.update_iteration_count("test", 0).unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[test]
    fn expired_deadline_times_out_on_kth_iteration() {
        let state = RuntimeState::new(
            RuntimeConfig::new()
                .with_max_loop_iterations(1_000_000)
                .with_deadline_check_every_n_iterations(2),
        );
        state.deadline_ms.set(Some(now_ms() - 1));
        state.update_iteration_count("test", 0).unwrap();
        let err = state.update_iteration_count("test", 0).unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[test]
    fn snapshot_round_trips() {
        let state = RuntimeState::default();
        state
            .globals
            .borrow_mut()
            .insert("x".to_string(), RuntimeValue::Int(7));
        let snap = state.snapshot();
        let fresh = RuntimeState::default();
        fresh.restore_snapshot(&snap);
        assert_eq!(fresh.globals.borrow().len(), 1);
    }
}
