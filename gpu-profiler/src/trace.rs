//! Chunked trace buffer decoding
//!
//! A trace result holds one segment per hardware sub-unit, laid out as:
//!
//! ```text
//! | len: u64 (LE) | payload: len bytes | pad to 8 | len: u64 | payload | pad | ...
//! ```
//!
//! The declared total size of a buffer bounds the sum of chunk payload
//! lengths; exceeding it is an error. Decoding stops once either the payload
//! sum or the padded footprint (length headers excluded) reaches it.

use crate::error::{ProfilerError, Result};
use std::collections::BTreeSet;

/// Chunk payloads start and end on this boundary
pub const CHUNK_ALIGNMENT: u64 = 8;

const LENGTH_FIELD: usize = std::mem::size_of::<u64>();

/// Round `size` up to the next multiple of `alignment` (a power of two)
pub fn align_up(size: u64, alignment: u64) -> u64 {
    (size + alignment - 1) & !(alignment - 1)
}

/// One decoded trace segment, borrowed from the buffer it was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceChunk<'a> {
    /// Sub-unit that produced the chunk
    pub unit: u32,
    pub payload: &'a [u8],
}

impl<'a> TraceChunk<'a> {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Framing state shared by both decoding paths.
///
/// The buffer walk in [`TraceChunks`] and the runtime-driven iteration in
/// [`ProfilingSession::iterate_trace`](crate::runtime::ProfilingSession::iterate_trace)
/// feed every chunk through the same framer, which owns the size totals and
/// keeps unit labels unique.
#[derive(Debug, Clone)]
pub struct ChunkFramer {
    limit: Option<u64>,
    consumed: u64,
    decoded: u64,
    units: BTreeSet<u32>,
}

impl ChunkFramer {
    /// Framer for a buffer with a declared total size
    pub fn bounded(total_size: u64) -> Self {
        Self {
            limit: Some(total_size),
            consumed: 0,
            decoded: 0,
            units: BTreeSet::new(),
        }
    }

    /// Framer for runtime-driven iteration, where no total is declared
    pub fn unbounded() -> Self {
        Self {
            limit: None,
            consumed: 0,
            decoded: 0,
            units: BTreeSet::new(),
        }
    }

    /// Account for the next chunk of a buffer and return its sequential unit label
    pub fn accept(&mut self, len: u64) -> Result<u32> {
        let unit = self.chunk_count();
        self.accept_unit(unit, len)?;
        Ok(unit)
    }

    /// Account for a chunk whose unit label was assigned by the runtime.
    ///
    /// Fails when the payload sum would exceed the declared total, or when
    /// `unit` was already seen (its trace file would be overwritten).
    pub fn accept_unit(&mut self, unit: u32, len: u64) -> Result<()> {
        if self.units.contains(&unit) {
            return Err(ProfilerError::DuplicateTraceUnit(unit));
        }
        let decoded = self.decoded.checked_add(len).unwrap_or(u64::MAX);
        if let Some(declared) = self.limit {
            if decoded > declared {
                return Err(ProfilerError::TraceDecodeOverflow {
                    declared,
                    required: decoded,
                });
            }
        }

        let footprint = len.checked_next_multiple_of(CHUNK_ALIGNMENT).unwrap_or(u64::MAX);
        self.consumed = self.consumed.saturating_add(footprint);
        self.decoded = decoded;
        self.units.insert(unit);
        Ok(())
    }

    /// True once the declared total has been consumed
    pub fn is_complete(&self) -> bool {
        self.limit
            .map_or(false, |declared| self.decoded >= declared || self.consumed >= declared)
    }

    /// Sum of chunk payload lengths, excluding padding
    pub fn decoded_bytes(&self) -> u64 {
        self.decoded
    }

    /// Sum of padded chunk footprints
    pub fn consumed_bytes(&self) -> u64 {
        self.consumed
    }

    pub fn chunk_count(&self) -> u32 {
        self.units.len() as u32
    }
}

/// Single-pass iterator over the chunks of a trace buffer.
///
/// Yields `Err` at most once; the iterator is exhausted afterwards.
#[derive(Debug)]
pub struct TraceChunks<'a> {
    buffer: &'a [u8],
    offset: usize,
    framer: ChunkFramer,
    failed: bool,
}

impl<'a> TraceChunks<'a> {
    /// Framing state after the chunks yielded so far
    pub fn framer(&self) -> &ChunkFramer {
        &self.framer
    }

    fn truncated(&mut self, needed: usize) -> ProfilerError {
        self.failed = true;
        ProfilerError::TraceTruncated {
            offset: self.offset,
            needed,
            available: self.buffer.len().saturating_sub(self.offset),
        }
    }

    fn next_chunk(&mut self) -> Result<TraceChunk<'a>> {
        let buffer: &'a [u8] = self.buffer;
        let header_end = self.offset + LENGTH_FIELD;
        let header = match buffer.get(self.offset..header_end) {
            Some(header) => header,
            None => return Err(self.truncated(LENGTH_FIELD)),
        };
        let mut length = [0u8; LENGTH_FIELD];
        length.copy_from_slice(header);
        let len = u64::from_le_bytes(length);

        let unit = self.framer.accept(len).map_err(|e| {
            self.failed = true;
            e
        })?;

        let payload = usize::try_from(len)
            .ok()
            .and_then(|len| header_end.checked_add(len).map(|end| (len, end)))
            .and_then(|(len, end)| buffer.get(header_end..end).map(|p| (len, p)));
        let (len, payload) = match payload {
            Some(found) => found,
            None => {
                let needed = LENGTH_FIELD.saturating_add(usize::try_from(len).unwrap_or(usize::MAX));
                return Err(self.truncated(needed));
            }
        };

        self.offset = header_end + align_up(len as u64, CHUNK_ALIGNMENT) as usize;
        Ok(TraceChunk { unit, payload })
    }
}

impl<'a> Iterator for TraceChunks<'a> {
    type Item = Result<TraceChunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.framer.is_complete() {
            return None;
        }
        Some(self.next_chunk())
    }
}

impl std::iter::FusedIterator for TraceChunks<'_> {}

/// Decode the chunks of `buffer`, whose payloads add up to at most `total_size`
pub fn decode(buffer: &[u8], total_size: u64) -> TraceChunks<'_> {
    TraceChunks {
        buffer,
        offset: 0,
        framer: ChunkFramer::bounded(total_size),
        failed: false,
    }
}

/// Host copy of a chunked trace result.
///
/// Owned by the feature result it arrived in and released when the owning
/// context is finalized. Chunk views never outlive a borrow of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceBuffer {
    data: Vec<u8>,
    declared_size: u64,
}

impl TraceBuffer {
    pub fn new(data: Vec<u8>, declared_size: u64) -> Self {
        Self {
            data,
            declared_size,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn chunks(&self) -> TraceChunks<'_> {
        decode(&self.data, self.declared_size)
    }

    /// Give the memory back
    pub fn release(self) {
        drop(self);
    }
}

/// Frame `payloads` into a chunked buffer, one chunk per payload
pub fn encode_chunks<P: AsRef<[u8]>>(payloads: &[P]) -> TraceBuffer {
    let mut data = Vec::new();
    let mut declared = 0u64;

    for payload in payloads {
        let payload = payload.as_ref();
        let padded = align_up(payload.len() as u64, CHUNK_ALIGNMENT);
        data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        data.extend_from_slice(payload);
        data.resize(data.len() + (padded as usize - payload.len()), 0);
        declared += padded;
    }

    TraceBuffer::new(data, declared)
}
