//! Scheduler Interface (spec §6 "Host scheduler contract").
//!
//! The engine itself never touches an OS thread, a timer, or a socket —
//! every one of those crosses the host boundary through this trait. A host
//! embedding the engine supplies an implementation; this module also ships
//! `LocalScheduler`, a single-threaded reference implementation used by this
//! crate's own tests and suitable as a starting point for a real host.
//!
//! Every `AsyncTask` payload closure is `Rc`-based (spec §4.5), so this
//! trait is deliberately not `Send` — a script instance and everything it
//! suspends with lives on one thread at a time, which is also the premise
//! behind `thread_context()`/`schedule_event` routing work back to the
//! instance's own event loop rather than an arbitrary pool thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::async_task::{BlockingTask, NonBlockingTask, ResumeCallback};
use crate::error::EngineError;
use crate::runtime_state::ContextToken;
use crate::value::RuntimeValue;

/// Host-provided scheduling contract (spec §6). All four operations are
/// ones the embedding host is better positioned to implement than the
/// engine: blocking work needs a pool sized for blocking, event-thread work
/// needs to land back on the right reactor, and checkpoint persistence
/// needs a real store.
#[async_trait(?Send)]
pub trait Scheduler {
    /// Runs `task` on a pool that tolerates blocking and returns its result.
    async fn schedule_blocking(&self, task: BlockingTask) -> Result<RuntimeValue, EngineError>;

    /// Arranges for `task` to run on the event loop identified by
    /// `thread_ctx_token`, returning immediately; the task's own
    /// `resume_callback` is invoked later, possibly from a different stack.
    fn schedule_event(&self, thread_ctx_token: ContextToken, task: NonBlockingTask);

    /// Identifies the event loop the caller is currently running on.
    fn thread_context(&self) -> ContextToken;

    /// Persists `bytes` (a checkpoint produced by `codec::checkpoint`) under
    /// `(instance_id, checkpoint_id)` and eventually calls `resume(Ok(Null))`
    /// (or `resume(Err(..))` on a storage failure). `source_id`/`offset`
    /// locate the suspension point for diagnostics; `data` is the value list
    /// the script passed at the checkpoint call site.
    async fn save_checkpoint(
        &self,
        instance_id: Uuid,
        checkpoint_id: Uuid,
        bytes: Vec<u8>,
        source_id: String,
        offset: u32,
        data: Vec<RuntimeValue>,
        resume: ResumeCallback,
    );
}

/// Single-threaded reference `Scheduler`. Runs blocking work inline on the
/// caller's stack rather than dispatching to a real blocking pool — fine for
/// tests and for hosts that only need one thread, not a template for a
/// production deployment under real blocking I/O (a host with actual pool
/// threads needs `Send` task closures, which this `Rc`-based engine does not
/// provide; see the module doc).
pub struct LocalScheduler {
    context: ContextToken,
    checkpoints: RefCell<HashMap<(Uuid, Uuid), Vec<u8>>>,
}

impl LocalScheduler {
    pub fn new(context: ContextToken) -> Self {
        Self {
            context,
            checkpoints: RefCell::new(HashMap::new()),
        }
    }

    /// Test/inspection hook: the bytes most recently handed to
    /// `save_checkpoint` for a given key.
    pub fn stored_checkpoint(&self, instance_id: Uuid, checkpoint_id: Uuid) -> Option<Vec<u8>> {
        self.checkpoints.borrow().get(&(instance_id, checkpoint_id)).cloned()
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait(?Send)]
impl Scheduler for LocalScheduler {
    async fn schedule_blocking(&self, task: BlockingTask) -> Result<RuntimeValue, EngineError> {
        (task.work)(&task.meta.data)
    }

    fn schedule_event(&self, thread_ctx_token: ContextToken, task: NonBlockingTask) {
        let data = task.meta.data.clone();
        let resume: ResumeCallback = Rc::new(|_| {});
        (task.initiator)(thread_ctx_token, &data, resume);
    }

    fn thread_context(&self) -> ContextToken {
        self.context
    }

    async fn save_checkpoint(
        &self,
        instance_id: Uuid,
        checkpoint_id: Uuid,
        bytes: Vec<u8>,
        _source_id: String,
        _offset: u32,
        _data: Vec<RuntimeValue>,
        resume: ResumeCallback,
    ) {
        self.checkpoints.borrow_mut().insert((instance_id, checkpoint_id), bytes);
        resume(Ok(RuntimeValue::Null));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_state::RuntimeStateSnapshot;

    #[tokio::test]
    async fn schedule_blocking_runs_work_and_returns_result() {
        let scheduler = LocalScheduler::default();
        let task = BlockingTask {
            meta: crate::async_task::TaskMeta {
                source_id: "test.script".to_string(),
                offset: 0,
                data: vec![RuntimeValue::Int(3), RuntimeValue::Int(4)],
                snapshot: RuntimeStateSnapshot::default(),
            },
            work: Rc::new(|data| {
                let sum: i32 = data
                    .iter()
                    .map(|v| match v {
                        RuntimeValue::Int(n) => *n,
                        _ => 0,
                    })
                    .sum();
                Ok(RuntimeValue::Int(sum))
            }),
        };
        let result = scheduler.schedule_blocking(task).await.unwrap();
        assert_eq!(result, RuntimeValue::Int(7));
    }

    #[tokio::test]
    async fn save_checkpoint_stores_bytes_and_invokes_resume() {
        let scheduler = LocalScheduler::default();
        let instance_id = Uuid::now_v7();
        let checkpoint_id = Uuid::now_v7();
        let resumed = Rc::new(RefCell::new(None));
        let resumed_clone = resumed.clone();
        scheduler
            .save_checkpoint(
                instance_id,
                checkpoint_id,
                vec![1, 2, 3],
                "test.script".to_string(),
                0,
                vec![],
                Rc::new(move |r| *resumed_clone.borrow_mut() = Some(r)),
            )
            .await;
        assert_eq!(scheduler.stored_checkpoint(instance_id, checkpoint_id), Some(vec![1, 2, 3]));
        assert!(matches!(*resumed.borrow(), Some(Ok(RuntimeValue::Null))));
    }

    #[test]
    fn thread_context_returns_constructed_token() {
        let scheduler = LocalScheduler::new(42);
        assert_eq!(scheduler.thread_context(), 42);
    }
}
