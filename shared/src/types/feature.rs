//! Requested profiling features (counters and traces)

use crate::utils::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of data a feature collects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    /// Hardware counter or derived metric, read as a single 64-bit value
    Metric,
    /// Hardware trace, read as a chunked byte buffer
    Trace,
}

/// Trace parameters understood by the hardware trace unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceParameterName {
    #[serde(rename = "COMPUTE_UNIT_TARGET")]
    ComputeUnitTarget,
    #[serde(rename = "VM_ID_MASK")]
    VmIdMask,
    #[serde(rename = "MASK")]
    Mask,
    #[serde(rename = "TOKEN_MASK")]
    TokenMask,
    #[serde(rename = "TOKEN_MASK2")]
    TokenMask2,
}

impl TraceParameterName {
    pub const ALL: [TraceParameterName; 5] = [
        TraceParameterName::ComputeUnitTarget,
        TraceParameterName::VmIdMask,
        TraceParameterName::Mask,
        TraceParameterName::TokenMask,
        TraceParameterName::TokenMask2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TraceParameterName::ComputeUnitTarget => "COMPUTE_UNIT_TARGET",
            TraceParameterName::VmIdMask => "VM_ID_MASK",
            TraceParameterName::Mask => "MASK",
            TraceParameterName::TokenMask => "TOKEN_MASK",
            TraceParameterName::TokenMask2 => "TOKEN_MASK2",
        }
    }
}

impl fmt::Display for TraceParameterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TraceParameterName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ParseError::InvalidValue {
                what: "trace parameter",
                value: s.to_string(),
            })
    }
}

/// One trace unit parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceParameter {
    pub name: TraceParameterName,
    pub value: u32,
}

/// A counter or trace requested for every profiled dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub kind: FeatureKind,

    /// Trace unit parameters (traces only)
    #[serde(default)]
    pub parameters: Vec<TraceParameter>,

    /// Deliver trace data as a host copy instead of iterating device memory
    #[serde(default)]
    pub copy: bool,
}

impl Feature {
    /// Create a metric feature
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Metric,
            parameters: Vec::new(),
            copy: false,
        }
    }

    /// Create a trace feature
    pub fn trace(name: impl Into<String>, copy: bool, parameters: Vec<TraceParameter>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Trace,
            parameters,
            copy,
        }
    }

    pub fn is_trace(&self) -> bool {
        self.kind == FeatureKind::Trace
    }
}
