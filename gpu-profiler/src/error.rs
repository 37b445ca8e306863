//! Profiling core errors
//!
//! Every variant here is an integrity or runtime failure of a profiling
//! session. None of them is recoverable for the dispatch it concerns: the
//! agent escalates them through [`fatal`].

use kdprof_shared::DispatchOrdinal;
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("context store corruption, ordinal {0} repeated")]
    DuplicateOrdinal(DispatchOrdinal),

    #[error("context store has no entry for ordinal {0}")]
    MissingContext(DispatchOrdinal),

    #[error("trace data size {required} is out of the result buffer size {declared}")]
    TraceDecodeOverflow { declared: u64, required: u64 },

    #[error("trace unit {0} reported more than once")]
    DuplicateTraceUnit(u32),

    #[error("trace buffer truncated at offset {offset}: need {needed} bytes, have {available}")]
    TraceTruncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("feature '{feature}' returned undefined data kind({kind})")]
    UnknownResultKind { feature: String, kind: u32 },

    #[error("expected exactly one profiling group, runtime reported {0}")]
    UnexpectedGroupCount(u32),

    #[error("profiling session error: {0}")]
    Session(String),

    #[error("cannot write trace file '{path}': {source}")]
    TraceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

impl ProfilerError {
    pub fn session(msg: impl Into<String>) -> Self {
        ProfilerError::Session(msg.into())
    }
}

pub type Result<T, E = ProfilerError> = std::result::Result<T, E>;

/// Report a broken invariant and terminate the process.
///
/// Hardware sessions, trace buffers and the context registry cannot be left
/// in a half-finalized state, so there is no way to continue past these.
pub fn fatal(err: ProfilerError) -> ! {
    error!("fatal profiling error: {}", err);
    eprintln!("kdprof: fatal: {}", err);
    std::process::abort()
}

/// Unwrap a profiling result or terminate through [`fatal`]
pub fn or_fatal<T>(result: Result<T>) -> T {
    result.unwrap_or_else(|e| fatal(e))
}
