//! L0 MEP parsing.
//!
//! An L0 MEP bundles consecutive events from one detector subsystem. The
//! header carries the source ID and the first event number; fragment `i`
//! implicitly has event number `first + i`, cross-checked against the LSB
//! byte each fragment carries. Length checks happen before every read so a
//! truncated or lying packet fails cleanly.

use crate::sources::SourceTable;

use super::{read_u16_le, read_u32_le, L0Fragment, MepBuffer, MepError};

/// L0 MEP header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Per-fragment header size in bytes.
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// Supported framing version.
pub const VERSION: u8 = 1;

/// Flag bit marking the burst's final event.
const FLAG_LAST_OF_BURST: u8 = 0x01;

/// A parsed L0 MEP. The fragment count is fixed at parse time.
#[derive(Debug)]
pub struct L0Mep {
    source_id: u8,
    first_event_number: u32,
    fragments: Vec<L0Fragment>,
}

impl L0Mep {
    pub fn source_id(&self) -> u8 {
        self.source_id
    }

    pub fn first_event_number(&self) -> u32 {
        self.first_event_number
    }

    pub fn event_count(&self) -> usize {
        self.fragments.len()
    }

    /// Consume the MEP, yielding its fragments. Each fragment keeps the
    /// datagram buffer alive until it is dropped.
    pub fn into_fragments(self) -> Vec<L0Fragment> {
        self.fragments
    }

    pub fn fragments(&self) -> &[L0Fragment] {
        &self.fragments
    }
}

/// Parse the `payload` byte range of `buf` as an L0 MEP.
///
/// Every fragment's source ID is the MEP header's; an ID outside `sources`
/// fails the whole MEP and installs nothing.
pub fn parse(
    buf: &MepBuffer,
    payload_start: usize,
    payload_len: usize,
    sources: &SourceTable,
) -> Result<L0Mep, MepError> {
    let data = &buf.as_slice()[payload_start..payload_start + payload_len];

    if data.len() < HEADER_SIZE {
        return Err(MepError::Truncated { size: data.len() });
    }

    let source_id = data[0];
    let version = data[1];
    let event_count = read_u16_le(data, 2) as usize;
    let mep_length = read_u16_le(data, 4) as usize;
    let first_event_number = read_u32_le(data, 8);

    if version != VERSION {
        return Err(MepError::UnsupportedVersion { raw: version });
    }

    if mep_length != data.len() {
        return Err(MepError::LengthMismatch {
            declared: mep_length,
            actual: data.len(),
        });
    }

    if event_count == 0 {
        return Err(MepError::EmptyMep);
    }

    if !sources.contains(source_id) {
        return Err(MepError::UnknownSource { source_id });
    }

    let payload = data.len() - HEADER_SIZE;
    if event_count * FRAGMENT_HEADER_SIZE > payload {
        return Err(MepError::CountOverflow {
            count: event_count,
            payload,
        });
    }

    let mut fragments = Vec::with_capacity(event_count);
    let mut cursor = HEADER_SIZE;

    for index in 0..event_count {
        if cursor + FRAGMENT_HEADER_SIZE > data.len() {
            return Err(MepError::FragmentOverrun { index });
        }

        let length = read_u16_le(data, cursor) as usize;
        if length < FRAGMENT_HEADER_SIZE {
            return Err(MepError::FragmentRunt { index, length });
        }
        if cursor + length > data.len() {
            return Err(MepError::FragmentOverrun { index });
        }

        let event_number = first_event_number.wrapping_add(index as u32);
        let lsb = data[cursor + 2];
        if lsb != (event_number & 0xFF) as u8 {
            return Err(MepError::EventNumberMismatch {
                index,
                got: lsb,
                expected: (event_number & 0xFF) as u8,
            });
        }

        let flags = data[cursor + 3];

        fragments.push(L0Fragment {
            buf: buf.clone(),
            payload_offset: payload_start + cursor + FRAGMENT_HEADER_SIZE,
            payload_len: length - FRAGMENT_HEADER_SIZE,
            source_id,
            event_number,
            last_of_burst: flags & FLAG_LAST_OF_BURST != 0,
        });

        cursor += length;
    }

    Ok(L0Mep {
        source_id,
        first_event_number,
        fragments,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
