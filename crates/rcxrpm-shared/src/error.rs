//! Error types for rcxrpm.

use thiserror::Error;

/// The injection sub-step that failed, stable across platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectStep {
    /// Allocating scratch memory in the target
    Allocate,
    /// Writing the payload path into the target
    WritePath,
    /// Resolving the loader entry point (LoadLibraryA / dlopen)
    ResolveLoader,
    /// Running the loader call in the target
    InvokeLoader,
    /// The loader call did not complete in time
    Timeout,
}

impl std::fmt::Display for InjectStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InjectStep::Allocate => "allocate",
            InjectStep::WritePath => "write-path",
            InjectStep::ResolveLoader => "resolve-loader",
            InjectStep::InvokeLoader => "invoke-loader",
            InjectStep::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to attach/allocate/create a thread in the target.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Injection failed at a specific step; the step kind is stable, the
    /// detail string is platform diagnostic text.
    #[error("injection failed ({step}): {detail}")]
    InjectionFailed { step: InjectStep, detail: String },

    /// The agent exists but never signalled readiness within the timeout.
    #[error("agent did not signal readiness: {0}")]
    NotReady(String),

    /// The RPC timed out or the channel vanished; the session is dead.
    #[error("session disconnected")]
    Disconnected,

    /// A read touched unreadable memory; affected ranges were zero-filled.
    #[error("read was partial; unreadable ranges zero-filled")]
    PartialRead,

    /// The write target range is not writable; nothing was modified.
    #[error("write rejected by agent")]
    WriteRejected,

    /// Header version mismatch, record offsets outside the data region, or a
    /// request that cannot fit the channel.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
