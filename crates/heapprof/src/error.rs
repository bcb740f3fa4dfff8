use thiserror::Error;

use crate::config::MAX_FRAMES_CAP;

/// Errors surfaced by the profiler control surface and snapshot analysis.
///
/// Per-allocation operations never fail.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerError {
    #[error("the heap profiler is already running")]
    AlreadyRunning,

    #[error("the number of frames must be in range 0-{MAX_FRAMES_CAP}, got {0}")]
    InvalidMaxFrames(usize),

    #[error("the heap profiler is not started")]
    NotAttached,

    #[error("cumulative statistics cannot be grouped by traceback")]
    CumulativeTraceback,

    #[error("invalid filename pattern")]
    InvalidFilterPattern,
}

/// Result type used by the control surface.
pub type Result<T, E = ProfilerError> = std::result::Result<T, E>;
