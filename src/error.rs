//! Error taxonomy (spec §7).
//!
//! `RuntimeError` is user-observable and carries source/offset for
//! diagnostics. `CheckpointFormatError` and `InternalError` are terminal —
//! callers should not attempt to continue the script after either.

use thiserror::Error;

/// User-observable runtime failure, with source text and byte offset for
/// diagnostics (spec §7 "RuntimeError").
#[derive(Error, Debug, Clone)]
#[error("{message} (at {source_id}:{offset})")]
pub struct RuntimeError {
    pub message: String,
    pub source_id: String,
    pub offset: u32,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, source_id: impl Into<String>, offset: u32) -> Self {
        Self {
            message: message.into(),
            source_id: source_id.into(),
            offset,
        }
    }
}

/// Raised when a loop exceeds `max_loop_iterations` or the wall-clock
/// deadline expires (spec §4.8, §8 "Timeout" scenario).
#[derive(Error, Debug, Clone)]
#[error("timeout: {reason} (at {source_id}:{offset})")]
pub struct TimeoutError {
    pub reason: String,
    pub source_id: String,
    pub offset: u32,
}

/// User-initiated termination (the scripting language's `die` statement).
#[derive(Error, Debug, Clone)]
#[error("die: {message:?}")]
pub struct DieError {
    pub message: Option<String>,
}

/// Internal sentinel the `Stream` iterator uses to signal end-of-source.
/// Never observed by user code.
#[derive(Error, Debug, Clone, Copy)]
#[error("null sentinel (stream end)")]
pub struct NullError;

/// Non-recoverable: raised while restoring a checkpoint whose bytes don't
/// match what the reader expected (bad tag, bad id, bad version).
#[derive(Error, Debug, Clone)]
#[error("checkpoint format error at byte offset {offset}: {reason}")]
pub struct CheckpointFormatError {
    pub offset: usize,
    pub reason: String,
}

impl CheckpointFormatError {
    pub fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            offset,
            reason: reason.into(),
        }
    }
}

/// Invariant violation — a bug in the runtime or in compiler-emitted code.
/// Never expected in correct operation; always terminal.
#[derive(Error, Debug, Clone)]
#[error("internal error: {0}")]
pub struct InternalError(pub String);

impl InternalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The umbrella error type threaded through the public API. User code and
/// the resumption machinery catch runtime/timeout/die errors "like values"
/// (spec §7); format and internal errors are always terminal.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Die(#[from] DieError),
    #[error(transparent)]
    CheckpointFormat(#[from] CheckpointFormatError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl EngineError {
    /// Timeout errors are a subclass of runtime error (spec §7); this lets
    /// resumption code treat the two uniformly when deciding whether a
    /// failure is user-catchable.
    pub fn is_user_catchable(&self) -> bool {
        matches!(
            self,
            EngineError::Runtime(_) | EngineError::Timeout(_) | EngineError::Die(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
