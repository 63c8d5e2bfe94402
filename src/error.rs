//! Error and status types surfaced across the input layer, scheduler and
//! analyzer driver (§7).

use thiserror::Error;

/// Errors that can fail `Scheduler::init` or other setup-time operations.
/// These are synchronous configuration/IO failures, never a mid-run
/// per-record condition (those are `StreamStatus`).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to open trace file {path}: {source}")]
    FileOpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read trace file: {0}")]
    FileReadFailed(String),
    #[error("failed to write schedule recording: {0}")]
    FileWriteFailed(String),
    #[error("instruction range invalid: {0}")]
    RangeInvalid(String),
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("internal scheduler invariant violated: {0}")]
    Invalid(String),
}

/// The result of a single `next_record` call, or any other per-record
/// operation on an output stream.
///
/// Left `#[non_exhaustive]` per DESIGN.md: callers inside this crate match
/// exhaustively, but external tool implementations built against this
/// crate should not break if a new status is added later.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamStatus {
    Ok,
    Eof,
    Idle,
    Wait,
    Skipped,
    Stole,
    RegionInvalid,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamStatus::Eof)
    }
}
