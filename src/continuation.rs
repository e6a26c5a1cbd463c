//! Continuation Frame & Chain (spec §4.4).
//!
//! The source language propagates a suspension by throwing an exception-like
//! chain of frames up the call stack; per spec §9's own design note this
//! crate re-architects that as an explicit tagged return value walked by a
//! trampoline — no host exception mechanism is required.
//!
//! One simplification from the literal prose of §4.4: rather than relocating
//! `async_task` onto the newest wrapping frame at every rethrow (an artifact
//! of catching by exception type, where only the outermost frame is directly
//! in hand), this implementation leaves `async_task` on whichever frame
//! created it and lets the trampoline walk `child` links to find it. The
//! invariant spec calls out — "exactly one frame in a chain holds the
//! `async_task`" — holds either way; this crate's runner always has the
//! whole chain in hand, so the extra relocation step buys nothing. Recorded
//! as an Open-Question-style decision in DESIGN.md.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::async_task::AsyncTask;
use crate::error::EngineError;
use crate::handle::{HandleRegistry, MethodHandle};
use crate::value::RuntimeValue;

pub type FrameRef = Rc<RefCell<ContinuationFrame>>;

/// One link in the continuation chain (spec §3 "Continuation Frame").
pub struct ContinuationFrame {
    pub parent: Option<FrameRef>,
    pub child: Option<FrameRef>,
    pub method_handle: MethodHandle,
    pub method_location: u32,
    pub local_primitives: Vec<i64>,
    pub local_objects: Vec<RuntimeValue>,
    pub async_task: Option<AsyncTask>,
    pub script_instance: Option<Uuid>,
    pub result: Option<Result<RuntimeValue, EngineError>>,
}

impl ContinuationFrame {
    pub fn new_leaf(method_handle: MethodHandle, method_location: u32) -> Self {
        Self {
            parent: None,
            child: None,
            method_handle,
            method_location,
            local_primitives: Vec::new(),
            local_objects: Vec::new(),
            async_task: None,
            script_instance: None,
            result: None,
        }
    }
}

/// Builds the initial frame for a blocking suspension and returns it as a
/// ready-to-wrap leaf of the chain (spec §4.4 "Construction at suspension").
#[instrument(skip(method_handle, data, task))]
pub fn suspend_blocking(
    method_handle: MethodHandle,
    method_location: u32,
    data: Vec<RuntimeValue>,
    task: AsyncTask,
) -> FrameRef {
    debug!(method_location, "suspend: building leaf frame");
    let mut frame = ContinuationFrame::new_leaf(method_handle, method_location);
    frame.local_objects = data;
    frame.async_task = Some(task);
    Rc::new(RefCell::new(frame))
}

/// Every caller on the way back up the (logical) call stack invokes this to
/// construct its own wrapping frame and splice the caught frame beneath it.
pub fn wrap_frame(
    caught: FrameRef,
    caller_handle: MethodHandle,
    caller_location: u32,
    caller_primitives: Vec<i64>,
    caller_objects: Vec<RuntimeValue>,
) -> FrameRef {
    let mut new_frame = ContinuationFrame::new_leaf(caller_handle, caller_location);
    new_frame.local_primitives = caller_primitives;
    new_frame.local_objects = caller_objects;
    new_frame.child = Some(caught.clone());
    let new_ref = Rc::new(RefCell::new(new_frame));
    caught.borrow_mut().parent = Some(new_ref.clone());
    new_ref
}

/// Finds the innermost (deepest, nearest the original suspension point)
/// frame by walking `child` links.
pub fn leaf_of(mut frame: FrameRef) -> FrameRef {
    loop {
        let next = frame.borrow().child.clone();
        match next {
            Some(c) => frame = c,
            None => return frame,
        }
    }
}

/// Finds the async task anywhere in the chain (spec invariant: exactly one
/// frame holds it).
pub fn find_async_task(outer: &FrameRef) -> Option<AsyncTask> {
    let mut cur = outer.clone();
    loop {
        if let Some(t) = cur.borrow().async_task.clone() {
            return Some(t);
        }
        let next = cur.borrow().child.clone();
        match next {
            Some(c) => cur = c,
            None => return None,
        }
    }
}

/// The outcome a compiler-generated resume entrypoint produces when driven
/// with a frame (spec GLOSSARY "Resume entrypoint").
pub enum StepOutcome {
    /// The function returned normally with this value.
    Done(RuntimeValue),
    /// The function raised a runtime/timeout/die error to rethrow at the
    /// correct logical point (spec §7 propagation rule).
    Err(EngineError),
    /// The function hit a new suspension point while resuming; this same
    /// frame becomes the new leaf again with updated state.
    SuspendAgain {
        task: AsyncTask,
        resume_location: u32,
        local_primitives: Vec<i64>,
        local_objects: Vec<RuntimeValue>,
    },
}

pub type ResumeEntry = Rc<dyn Fn(&mut ContinuationFrame) -> StepOutcome>;

/// Registry of compiler-generated resume entrypoints, keyed the same way a
/// `MethodHandle::Wrapper` is keyed. Stands in for "reflect a field holding
/// a pre-stored handle" (spec §4.3) since this crate has no compiler of its
/// own to generate real entrypoints.
#[derive(Default)]
pub struct ResumeTable {
    by_name: RefCell<std::collections::HashMap<String, ResumeEntry>>,
}

impl ResumeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, entry: ResumeEntry) {
        self.by_name.borrow_mut().insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<ResumeEntry> {
        self.by_name.borrow().get(name).cloned()
    }
}

/// Resolves a `MethodHandle`'s resume entrypoint name, unwrapping `Bound`
/// handles to their inner wrapper (the binding itself doesn't change which
/// resume function runs, only what receiver it closes over).
pub fn resume_entry_name(handle: &MethodHandle) -> Option<String> {
    match handle {
        MethodHandle::Wrapper(w) => Some(w.function_name.clone()),
        MethodHandle::Plain(p) => Some(p.handle_field.clone()),
        MethodHandle::Iterator(i) => Some(i.handle_field.clone()),
        MethodHandle::Bound(b) => resume_entry_name(&b.inner),
    }
}

/// Final result of driving a chain to completion or the next suspension.
pub enum RunOutcome {
    Completed(RuntimeValue),
    Suspended(FrameRef),
    Failed(EngineError),
}

/// Walks the chain from the innermost frame outward, feeding each frame's
/// resume entrypoint the prior result, exactly as spec §4.4 "Resumption"
/// describes. `outer` is any frame in the chain — resolution starts from
/// its leaf.
#[instrument(skip_all)]
pub fn resume_chain(
    outer: FrameRef,
    initial: Result<RuntimeValue, EngineError>,
    table: &ResumeTable,
    _registry: &HandleRegistry,
) -> RunOutcome {
    let mut current = leaf_of(outer);
    let mut incoming = initial;

    loop {
        debug!(
            method_location = current.borrow().method_location,
            "resume: driving frame"
        );
        current.borrow_mut().result = Some(incoming.clone());

        let entry_name = match resume_entry_name(&current.borrow().method_handle) {
            Some(n) => n,
            None => {
                return RunOutcome::Failed(
                    crate::error::InternalError::new("frame has no resolvable resume handle")
                        .into(),
                )
            }
        };
        let entry = match table.get(&entry_name) {
            Some(e) => e,
            None => {
                return RunOutcome::Failed(
                    crate::error::InternalError::new(format!(
                        "no resume entrypoint registered for {entry_name}"
                    ))
                    .into(),
                )
            }
        };

        let outcome = entry(&mut *current.borrow_mut());
        match outcome {
            StepOutcome::Done(v) => {
                let parent = current.borrow().parent.clone();
                match parent {
                    Some(p) => {
                        incoming = Ok(v);
                        current = p;
                    }
                    None => {
                        debug!("resume: chain completed");
                        return RunOutcome::Completed(v);
                    }
                }
            }
            StepOutcome::Err(e) => {
                let parent = current.borrow().parent.clone();
                match parent {
                    Some(p) => {
                        incoming = Err(e);
                        current = p;
                    }
                    None => {
                        debug!(error = %e, "resume: chain failed");
                        return RunOutcome::Failed(e);
                    }
                }
            }
            StepOutcome::SuspendAgain {
                task,
                resume_location,
                local_primitives,
                local_objects,
            } => {
                {
                    let mut f = current.borrow_mut();
                    f.method_location = resume_location;
                    f.local_primitives = local_primitives;
                    f.local_objects = local_objects;
                    f.async_task = Some(task);
                    f.result = None;
                }
                debug!(resume_location, "resume: frame suspended again");
                return RunOutcome::Suspended(current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::WrapperHandle;

    fn handle(name: &str) -> MethodHandle {
        MethodHandle::Wrapper(WrapperHandle {
            owner_type: None,
            function_name: name.to_string(),
        })
    }

    #[test]
    fn leaf_of_walks_to_deepest_child() {
        let leaf = suspend_blocking(
            handle("inner"),
            0,
            vec![],
            AsyncTask::blocking_stub("src", 0),
        );
        let mid = wrap_frame(leaf.clone(), handle("mid"), 1, vec![], vec![]);
        let outer = wrap_frame(mid, handle("outer"), 2, vec![], vec![]);
        assert!(Rc::ptr_eq(&leaf_of(outer), &leaf));
    }

    #[test]
    fn async_task_found_via_child_walk() {
        let leaf = suspend_blocking(
            handle("inner"),
            0,
            vec![],
            AsyncTask::blocking_stub("src", 0),
        );
        let outer = wrap_frame(leaf, handle("outer"), 1, vec![], vec![]);
        assert!(find_async_task(&outer).is_some());
    }
}
