//! Multi-event packet (MEP) model.
//!
//! An MEP owns the datagram buffer it arrived in; the fragments produced by
//! parsing are views holding a shared handle to that buffer. The buffer is
//! freed when the last fragment is dropped, wherever in the pipeline that
//! happens.

pub mod l0;
pub mod lkr;

use std::sync::Arc;

use thiserror::Error;

/// Shared ownership of one received datagram.
#[derive(Debug, Clone)]
pub struct MepBuffer {
    data: Arc<[u8]>,
}

impl MepBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of live handles, the buffer itself included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

/// Errors that can occur while parsing an MEP. Any error fails the whole
/// MEP; no fragment from it is installed.
#[derive(Error, Debug)]
pub enum MepError {
    #[error("MEP too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unsupported MEP version: {raw}")]
    UnsupportedVersion { raw: u8 },

    #[error("MEP length field {declared} does not match payload length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("MEP declares zero events")]
    EmptyMep,

    #[error("{count} events cannot fit in {payload} payload bytes")]
    CountOverflow { count: usize, payload: usize },

    #[error("fragment {index}: length {length} below the fragment minimum")]
    FragmentRunt { index: usize, length: usize },

    #[error("fragment {index} overruns the MEP payload")]
    FragmentOverrun { index: usize },

    #[error("fragment {index}: event number LSB {got:#04x}, expected {expected:#04x}")]
    EventNumberMismatch { index: usize, got: u8, expected: u8 },

    #[error("unknown source ID {source_id:#04x}")]
    UnknownSource { source_id: u8 },

    #[error("unknown calorimeter crate ID {crate_id:#04x}")]
    UnknownCrate { crate_id: u8 },
}

/// One detector subsystem's contribution to one event. Holds the carrying
/// MEP buffer alive for as long as the fragment lives.
#[derive(Debug, Clone)]
pub struct L0Fragment {
    buf: MepBuffer,
    payload_offset: usize,
    payload_len: usize,
    source_id: u8,
    event_number: u32,
    last_of_burst: bool,
}

impl L0Fragment {
    pub fn source_id(&self) -> u8 {
        self.source_id
    }

    pub fn event_number(&self) -> u32 {
        self.event_number
    }

    /// Whether the front-end flagged this as the burst's final event.
    pub fn last_of_burst(&self) -> bool {
        self.last_of_burst
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_slice()[self.payload_offset..self.payload_offset + self.payload_len]
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

/// One calorimeter crate's contribution to one event.
#[derive(Debug, Clone)]
pub struct LkrFragment {
    buf: MepBuffer,
    payload_offset: usize,
    payload_len: usize,
    crate_id: u8,
    event_number: u32,
    non_zero_suppressed: bool,
}

impl LkrFragment {
    pub fn crate_id(&self) -> u8 {
        self.crate_id
    }

    pub fn event_number(&self) -> u32 {
        self.event_number
    }

    /// Whether this carries the high-bandwidth non-zero-suppressed readout.
    pub fn non_zero_suppressed(&self) -> bool {
        self.non_zero_suppressed
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_slice()[self.payload_offset..self.payload_offset + self.payload_len]
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers (bounds are checked by callers before fixed reads)
// ---------------------------------------------------------------------------

#[inline]
pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    let bytes: [u8; 2] = data[offset..offset + 2]
        .try_into()
        .expect("slice of length 2");
    u16::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let bytes: [u8; 4] = data[offset..offset + 4]
        .try_into()
        .expect("slice of length 4");
    u32::from_le_bytes(bytes)
}
