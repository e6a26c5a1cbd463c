//! Suspension/resumption engine for an embeddable dynamically-typed
//! scripting language: a Binary Codec for cycle-safe checkpointing, a
//! Continuation Frame chain that replaces the source language's
//! exception-based suspension with explicit tagged returns, a Lazy Iterator
//! Family whose every variant self-checkpoints, and the host-facing
//! Scheduler contract that ties it all to a real event loop.
//!
//! # Layout
//!
//! - [`value`] — the runtime value representation and its type tags.
//! - [`registry`] — built-in/user class registration and drift detection.
//! - [`descriptor`] — class and function descriptors, method lookup fallback.
//! - [`handle`] — the four-variant Method Handle Model.
//! - [`continuation`] — Continuation Frame, chain construction, resumption.
//! - [`async_task`] — Blocking/NonBlocking/Checkpoint task variants.
//! - [`runtime_state`] — the per-execution ambient (globals, loop timeout).
//! - [`instance`] — Script Instance identity and checkpoint counter.
//! - [`iterator`] — the Lazy Iterator Family.
//! - [`codec`] — the Binary Codec (checkpoint/restore).
//! - [`scheduler`] — the host scheduler contract plus a reference impl.
//! - [`error`] — the error taxonomy threaded through all of the above.
//! - [`host`] (feature `postgres`) — an example durable checkpoint backend.

pub mod async_task;
pub mod codec;
pub mod continuation;
pub mod descriptor;
pub mod error;
pub mod handle;
#[cfg(feature = "postgres")]
pub mod host;
pub mod instance;
pub mod iterator;
pub mod registry;
pub mod runtime_state;
pub mod scheduler;
pub mod value;

pub use async_task::AsyncTask;
pub use continuation::{ContinuationFrame, FrameRef, RunOutcome};
pub use error::{EngineError, EngineResult};
pub use instance::{ScriptInstance, ScriptInstanceId};
pub use registry::TypeRegistry;
pub use runtime_state::{RuntimeConfig, RuntimeState};
pub use scheduler::Scheduler;
pub use value::RuntimeValue;
