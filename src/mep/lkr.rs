//! Calorimeter (LKr) MEP parsing.
//!
//! Unlike L0 MEPs, calorimeter fragments carry explicit absolute event
//! numbers: the crates do not guarantee consecutive events in one packet.
//! A flag bit distinguishes the normal zero-suppressed readout from the
//! high-bandwidth non-zero-suppressed follow-up that L1 can request.

use crate::sources::SourceTable;

use super::{read_u16_le, read_u32_le, LkrFragment, MepBuffer, MepError};

/// LKr MEP header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Per-fragment header size in bytes.
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Supported framing version.
pub const VERSION: u8 = 1;

/// Source ID the calorimeter is accounted under. The LKr does not appear
/// in the L0 source set; its data flows on its own port.
pub const LKR_SOURCE_ID: u8 = 0x24;

/// Flag bit marking non-zero-suppressed data.
const FLAG_NON_ZERO_SUPPRESSED: u8 = 0x01;

/// A parsed LKr MEP. The fragment count is fixed at parse time.
#[derive(Debug)]
pub struct LkrMep {
    fragments: Vec<LkrFragment>,
}

impl LkrMep {
    pub fn event_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn into_fragments(self) -> Vec<LkrFragment> {
        self.fragments
    }

    pub fn fragments(&self) -> &[LkrFragment] {
        &self.fragments
    }
}

/// Parse the `payload` byte range of `buf` as an LKr MEP.
///
/// A crate ID outside `crates` fails the whole MEP and installs nothing.
pub fn parse(
    buf: &MepBuffer,
    payload_start: usize,
    payload_len: usize,
    crates: &SourceTable,
) -> Result<LkrMep, MepError> {
    let data = &buf.as_slice()[payload_start..payload_start + payload_len];

    if data.len() < HEADER_SIZE {
        return Err(MepError::Truncated { size: data.len() });
    }

    let fragment_count = data[0] as usize;
    let version = data[1];
    let mep_length = read_u16_le(data, 2) as usize;

    if version != VERSION {
        return Err(MepError::UnsupportedVersion { raw: version });
    }

    if mep_length != data.len() {
        return Err(MepError::LengthMismatch {
            declared: mep_length,
            actual: data.len(),
        });
    }

    if fragment_count == 0 {
        return Err(MepError::EmptyMep);
    }

    let payload = data.len() - HEADER_SIZE;
    if fragment_count * FRAGMENT_HEADER_SIZE > payload {
        return Err(MepError::CountOverflow {
            count: fragment_count,
            payload,
        });
    }

    let mut fragments = Vec::with_capacity(fragment_count);
    let mut cursor = HEADER_SIZE;

    for index in 0..fragment_count {
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

        let crate_id = data[cursor + 2];
        if !crates.contains(crate_id) {
            return Err(MepError::UnknownCrate { crate_id });
        }

        let flags = data[cursor + 3];
        let event_number = read_u32_le(data, cursor + 4);

        fragments.push(LkrFragment {
            buf: buf.clone(),
            payload_offset: payload_start + cursor + FRAGMENT_HEADER_SIZE,
            payload_len: length - FRAGMENT_HEADER_SIZE,
            crate_id,
            event_number,
            non_zero_suppressed: flags & FLAG_NON_ZERO_SUPPRESSED != 0,
        });

        cursor += length;
    }

    Ok(LkrMep { fragments })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
