//! Kernel dispatch profiling agent
//!
//! Wires the dispatch profiler to its inbound ports, loads configuration,
//! exports Prometheus metrics, and replays recorded dispatch streams
//! against the simulated runtime.

pub mod agent;
pub mod config;
pub mod metrics;
pub mod replay;

pub use agent::{Agent, AgentSummary, DispatchPort};
pub use config::{AgentConfig, ConfigError, TraceConfig};
pub use replay::{replay, Recording, ReplayStats};
