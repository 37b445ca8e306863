//! Result serialization
//!
//! Writes one context's feature results in the textual result format and,
//! when a trace directory is configured, one file per trace unit.

use crate::error::{ProfilerError, Result};
use crate::runtime::{FeatureResult, ProfilingSession, ResultData};
use crate::trace::{ChunkFramer, TraceChunk};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Path of the file holding one trace unit of a dispatch
pub fn trace_file_path(dir: &Path, label: &str, unit: u32) -> PathBuf {
    dir.join(format!("thread_trace_{}_se{}.out", label, unit))
}

/// Write a trace payload as 16-bit words, one `{:04x}` per line.
/// A trailing odd byte is not written.
pub fn write_trace_words(out: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    for word in payload.chunks_exact(2) {
        writeln!(out, "{:04x}", u16::from_le_bytes([word[0], word[1]]))?;
    }
    Ok(())
}

/// Chunks of one trace result, accounted through a framer so both decoding
/// paths total sizes and reject repeated units the same way
#[derive(Debug)]
struct ChunkSummary {
    framer: ChunkFramer,
    chunks: Vec<(u32, usize)>,
}

impl ChunkSummary {
    fn new() -> Self {
        Self {
            framer: ChunkFramer::unbounded(),
            chunks: Vec::new(),
        }
    }

    fn add(&mut self, chunk: &TraceChunk<'_>) -> Result<()> {
        self.framer.accept_unit(chunk.unit, chunk.len() as u64)?;
        self.chunks.push((chunk.unit, chunk.len()));
        Ok(())
    }

    fn write(&self, out: &mut dyn Write, name: &str) -> io::Result<()> {
        writeln!(out, "  {} size({})", name, self.framer.decoded_bytes())?;
        for (unit, len) in &self.chunks {
            writeln!(out, "    SE({}) size({})", unit, len)?;
        }
        Ok(())
    }
}

/// Serializes feature results of finalized contexts
#[derive(Debug, Clone, Default)]
pub struct ResultSink {
    trace_dir: Option<PathBuf>,
}

impl ResultSink {
    pub fn new(trace_dir: Option<PathBuf>) -> Self {
        Self { trace_dir }
    }

    pub fn trace_dir(&self) -> Option<&Path> {
        self.trace_dir.as_deref()
    }

    /// Write every result, in order. Trace buffers are released as soon as
    /// they have been written.
    pub fn emit(
        &self,
        out: &mut dyn Write,
        label: &str,
        results: Vec<FeatureResult>,
        session: &mut dyn ProfilingSession,
    ) -> Result<()> {
        for result in results {
            match result.data {
                ResultData::Int64(value) => {
                    writeln!(out, "  {} ({})", result.name, value)?;
                }
                ResultData::Bytes(buffer) => {
                    let mut summary = ChunkSummary::new();
                    for chunk in buffer.chunks() {
                        let chunk = chunk?;
                        self.record_chunk(label, &chunk, &mut summary)?;
                    }
                    summary.write(out, &result.name)?;
                    buffer.release();
                }
                ResultData::DeviceTrace => {
                    // units are labelled by the runtime and need not be sequential
                    let mut summary = ChunkSummary::new();
                    let mut visit = |chunk: TraceChunk<'_>| -> Result<()> {
                        self.record_chunk(label, &chunk, &mut summary)
                    };
                    session.iterate_trace(&mut visit)?;
                    summary.write(out, &result.name)?;
                }
                ResultData::Unrecognized(kind) => {
                    return Err(ProfilerError::UnknownResultKind {
                        feature: result.name,
                        kind,
                    });
                }
            }
        }
        Ok(())
    }

    fn record_chunk(&self, label: &str, chunk: &TraceChunk<'_>, summary: &mut ChunkSummary) -> Result<()> {
        summary.add(chunk)?;
        if let Some(dir) = &self.trace_dir {
            self.dump_unit(dir, label, chunk)?;
        }
        Ok(())
    }

    fn dump_unit(&self, dir: &Path, label: &str, chunk: &TraceChunk<'_>) -> Result<()> {
        let path = trace_file_path(dir, label, chunk.unit);
        let write = || -> io::Result<()> {
            let mut file = BufWriter::new(File::create(&path)?);
            write_trace_words(&mut file, chunk.payload)?;
            file.flush()
        };
        write().map_err(|source| ProfilerError::TraceFile {
            path: path.clone(),
            source,
        })?;
        debug!("wrote {} trace bytes to {}", chunk.len(), path.display());
        Ok(())
    }
}
