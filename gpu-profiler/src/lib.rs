//! Dispatch profiling core
//!
//! Observes GPU kernel dispatches, opens a hardware profiling session for
//! each one that passes the filter, and writes its counter and trace results
//! once the dispatch completes (or when the profiler shuts down).

pub mod context;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod output;
pub mod runtime;
pub mod sink;
pub mod store;
pub mod trace;

pub use context::{ContextState, ProfilingContext};
pub use error::{fatal, or_fatal, ProfilerError, Result};
pub use filter::DispatchFilter;
pub use lifecycle::{CompletionStatus, DispatchOutcome, DispatchProfiler, ProfilerSettings};
pub use output::{OutputStream, SharedBuffer};
pub use runtime::sim::{SimulatedHardware, SimulatedRuntime};
pub use runtime::{
    CompletionCallback, CompletionNotifier, FeatureResult, ProfilingRuntime, ProfilingSession, ResultData,
};
pub use sink::ResultSink;
pub use store::ContextStore;
pub use trace::{decode, encode_chunks, TraceBuffer, TraceChunk};
