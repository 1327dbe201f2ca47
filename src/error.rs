//! Crate-wide error taxonomy.
//!
//! Every public engine operation returns `Result<T, EngineError>`. There is
//! no separate "fatal" variant — only `main()` decides that a startup error
//! is fatal and exits; once the engine is running, every variant here is
//! logged and the engine keeps going degraded.

use crate::registry::Class;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid attribute key, duplicate key, value out of range, unknown
    /// class/command.
    #[error("usage error: {0}")]
    Usage(String),

    /// No free slot for a class, or no free link slot.
    #[error("no free {0:?} slot available")]
    SlotExhausted(Class),

    /// No link slot available (separate from worker-slot exhaustion).
    #[error("no free link slot available")]
    LinkExhausted,

    /// Path does not exist / not regular, port <= 1024 without root,
    /// packet size 0, working set > total, etc.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Disk seek/read/write error, TCP remote close, and similar.
    #[error("kernel failure: {0}")]
    Kernel(String),

    /// OS lock/condvar failure, or an ordering violation escalated to an
    /// aborted operation.
    #[error("lock error: {0}")]
    Lock(String),

    /// Unknown worker/link label referenced by a command.
    #[error("unknown label: {0}")]
    NotFound(String),

    /// I/O error bubbled up from std.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Calibration file is malformed.
    #[error("calibration file error: {0}")]
    Calibration(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
