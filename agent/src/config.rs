//! Configuration types for the profiling agent
//!
//! Settings are layered: an optional file (TOML, JSON or YAML, picked by
//! extension), then `KDPROF_*` environment variables, then command line
//! overrides applied by the binary.

use kdprof_gpu::ProfilerSettings;
use kdprof_shared::utils::{parse_c_integer, split_list, ParseError};
use kdprof_shared::{CompletionMode, Feature, FilterSpec, OrdinalRange, TraceParameter, TraceParameterName};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix of environment variables read by [`AgentConfig::load`]
pub const ENV_PREFIX: &str = "KDPROF";

/// Name of the results file inside the output directory
pub const RESULTS_FILE: &str = "results.txt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("output directory '{path}': {reason}")]
    OutputDir { path: PathBuf, reason: String },

    #[error("cannot create results file '{path}': {source}")]
    ResultsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("trace '{trace}': unknown parameter '{name}'")]
    UnknownTraceParameter { trace: String, name: String },

    #[error("trace '{trace}': invalid value '{value}' for parameter {name}")]
    InvalidParameterValue {
        trace: String,
        name: TraceParameterName,
        value: String,
    },

    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] ParseError),
}

/// Value of a trace parameter: an integer, or a C-style literal string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(u64),
    Text(String),
}

impl ParameterValue {
    fn resolve(&self) -> Result<u64, ParseError> {
        match self {
            ParameterValue::Int(value) => Ok(*value),
            ParameterValue::Text(text) => parse_c_integer(text),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(value) => write!(f, "{}", value),
            ParameterValue::Text(text) => f.write_str(text),
        }
    }
}

/// One requested trace feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    pub name: String,

    /// Deliver the trace as a pre-copied host buffer
    #[serde(default)]
    pub copy: bool,

    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl TraceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            copy: false,
            parameters: BTreeMap::new(),
        }
    }

    pub fn feature(&self) -> Result<Feature, ConfigError> {
        let mut parameters = Vec::with_capacity(self.parameters.len());
        for (key, value) in &self.parameters {
            // file sources may hand keys over lowercased
            let name: TraceParameterName =
                key.to_ascii_uppercase()
                    .parse()
                    .map_err(|_| ConfigError::UnknownTraceParameter {
                        trace: self.name.clone(),
                        name: key.clone(),
                    })?;
            let invalid = || ConfigError::InvalidParameterValue {
                trace: self.name.clone(),
                name,
                value: value.to_string(),
            };
            let value = value.resolve().map_err(|_| invalid())?;
            let value = u32::try_from(value).map_err(|_| invalid())?;
            parameters.push(TraceParameter { name, value });
        }
        Ok(Feature::trace(self.name.clone(), self.copy, parameters))
    }
}

/// Agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Results go to `<output_dir>/results.txt` and trace files next to
    /// it. Without it results go to stdout and no trace files are written.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Completion mode; see [`AgentConfig::completion_mode`]
    #[serde(default)]
    pub completion: Option<CompletionMode>,

    /// Counter names, in output order
    #[serde(default, deserialize_with = "deserialize_names")]
    pub metrics: Vec<String>,

    #[serde(default)]
    pub traces: Vec<TraceConfig>,

    #[serde(default)]
    pub filter: FilterSpec,
}

impl AgentConfig {
    /// Load from an optional file layered under `KDPROF_*` variables.
    ///
    /// Nested keys use a double underscore: `KDPROF_FILTER__RANGE=2:4`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Push when results go to a directory, pull otherwise, unless set explicitly
    pub fn completion_mode(&self) -> CompletionMode {
        self.completion.unwrap_or(if self.output_dir.is_some() {
            CompletionMode::Push
        } else {
            CompletionMode::Pull
        })
    }

    /// Path of the results file, if results do not go to stdout
    pub fn results_path(&self) -> Option<PathBuf> {
        self.output_dir.as_ref().map(|dir| dir.join(RESULTS_FILE))
    }

    /// Requested features: every metric, then every trace
    pub fn features(&self) -> Result<Vec<Feature>, ConfigError> {
        let metrics = self.metrics.iter().map(|name| Ok(Feature::metric(name.clone())));
        let traces = self.traces.iter().map(TraceConfig::feature);
        metrics.chain(traces).collect()
    }

    pub fn profiler_settings(&self) -> Result<ProfilerSettings, ConfigError> {
        Ok(ProfilerSettings {
            features: self.features()?,
            filter: self.filter.clone(),
            trace_dir: self.output_dir.clone(),
        })
    }

    /// Replace filter rules from command line values
    pub fn override_filter(
        &mut self,
        range: Option<&str>,
        gpu_index: Option<&str>,
        kernel: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(range) = range {
            self.filter.range = Some(range.parse::<OrdinalRange>()?);
        }
        if let Some(gpu_index) = gpu_index {
            let devices = split_list(gpu_index, ',')
                .map(|item| {
                    item.parse().map_err(|_| ParseError::InvalidValue {
                        what: "gpu index",
                        value: item.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.filter = std::mem::take(&mut self.filter).with_devices(devices);
        }
        if let Some(kernel) = kernel {
            self.filter = std::mem::take(&mut self.filter).with_kernel_substrings(split_list(kernel, ','));
        }
        Ok(())
    }

    /// Check everything that can fail before the first dispatch is observed
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dir) = &self.output_dir {
            let metadata = std::fs::metadata(dir).map_err(|e| ConfigError::OutputDir {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            if !metadata.is_dir() {
                return Err(ConfigError::OutputDir {
                    path: dir.clone(),
                    reason: "not a directory".to_string(),
                });
            }
            if metadata.permissions().readonly() {
                return Err(ConfigError::OutputDir {
                    path: dir.clone(),
                    reason: "not writable".to_string(),
                });
            }
        }
        self.features()?;
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Names {
    Text(String),
    Items(Vec<String>),
}

fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Names>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Names::Text(text)) => split_list(&text, ',').map(str::to_string).collect(),
        Some(Names::Items(items)) => items.into_iter().filter(|name| !name.is_empty()).collect(),
    })
}
