//! Async Task (spec §3 "Async Task variants", §4.5).
//!
//! Work that must occur off the current execution context: blocking work
//! run on a host-provided pool, non-blocking work that completes
//! externally, or a checkpoint request that synchronously serializes and
//! hands off to the host's persistence hook.

use std::rc::Rc;

use crate::error::EngineError;
use crate::runtime_state::{ContextToken, RuntimeStateSnapshot};
use crate::value::RuntimeValue;

pub type ResumeCallback = Rc<dyn Fn(Result<RuntimeValue, EngineError>)>;

/// Diagnostic/scheduling metadata every task variant carries.
#[derive(Clone)]
pub struct TaskMeta {
    pub source_id: String,
    pub offset: u32,
    pub data: Vec<RuntimeValue>,
    /// Thread-local runtime state as of task creation, re-installed on the
    /// resuming thread (spec §4.5 "recorded execution context").
    pub snapshot: RuntimeStateSnapshot,
}

#[derive(Clone)]
pub struct BlockingTask {
    pub meta: TaskMeta,
    /// Caller-supplied pure function `data -> value`, run off-thread.
    pub work: Rc<dyn Fn(&[RuntimeValue]) -> Result<RuntimeValue, EngineError>>,
}

#[derive(Clone)]
pub struct NonBlockingTask {
    pub meta: TaskMeta,
    /// `(context, data, resume_callback) -> ()`; returns immediately after
    /// arranging eventual invocation of `resume_callback`.
    pub initiator: Rc<dyn Fn(ContextToken, &[RuntimeValue], ResumeCallback)>,
}

#[derive(Clone)]
pub struct CheckpointTask {
    pub meta: TaskMeta,
}

/// Work that must occur off the current execution context (spec §3).
#[derive(Clone)]
pub enum AsyncTask {
    Blocking(BlockingTask),
    NonBlocking(NonBlockingTask),
    Checkpoint(CheckpointTask),
}

impl AsyncTask {
    pub fn meta(&self) -> &TaskMeta {
        match self {
            AsyncTask::Blocking(t) => &t.meta,
            AsyncTask::NonBlocking(t) => &t.meta,
            AsyncTask::Checkpoint(t) => &t.meta,
        }
    }

    pub fn blocking(
        source_id: impl Into<String>,
        offset: u32,
        data: Vec<RuntimeValue>,
        snapshot: RuntimeStateSnapshot,
        work: Rc<dyn Fn(&[RuntimeValue]) -> Result<RuntimeValue, EngineError>>,
    ) -> Self {
        AsyncTask::Blocking(BlockingTask {
            meta: TaskMeta {
                source_id: source_id.into(),
                offset,
                data,
                snapshot,
            },
            work,
        })
    }

    pub fn non_blocking(
        source_id: impl Into<String>,
        offset: u32,
        data: Vec<RuntimeValue>,
        snapshot: RuntimeStateSnapshot,
        initiator: Rc<dyn Fn(ContextToken, &[RuntimeValue], ResumeCallback)>,
    ) -> Self {
        AsyncTask::NonBlocking(NonBlockingTask {
            meta: TaskMeta {
                source_id: source_id.into(),
                offset,
                data,
                snapshot,
            },
            initiator,
        })
    }

    pub fn checkpoint(
        source_id: impl Into<String>,
        offset: u32,
        data: Vec<RuntimeValue>,
        snapshot: RuntimeStateSnapshot,
    ) -> Self {
        AsyncTask::Checkpoint(CheckpointTask {
            meta: TaskMeta {
                source_id: source_id.into(),
                offset,
                data,
                snapshot,
            },
        })
    }

    /// A minimal blocking task with no real work, for tests that only need
    /// chain-building plumbing.
    pub fn blocking_stub(source_id: impl Into<String>, offset: u32) -> Self {
        Self::blocking(
            source_id,
            offset,
            vec![],
            RuntimeStateSnapshot::default(),
            Rc::new(|_data| Ok(RuntimeValue::Null)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_task_runs_its_work() {
        let task = AsyncTask::blocking(
            "test.script",
            10,
            vec![RuntimeValue::Int(3), RuntimeValue::Int(5)],
            RuntimeStateSnapshot::default(),
            Rc::new(|data| {
                let sum: i64 = data
                    .iter()
                    .map(|v| match v {
                        RuntimeValue::Int(n) => *n as i64,
                        _ => 0,
                    })
                    .sum();
                Ok(RuntimeValue::Long(sum))
            }),
        );
        if let AsyncTask::Blocking(b) = &task {
            let result = (b.work)(&b.meta.data).unwrap();
            match result {
                RuntimeValue::Long(n) => assert_eq!(n, 8),
                _ => panic!("expected long"),
            }
        } else {
            panic!("expected blocking task");
        }
    }
}
