//! Storage hand-off for accepted events.
//!
//! The sink is a black box with a single contract: `send` consumes a fully
//! built event and reports how many bytes went downstream. Implementations
//! may copy, serialize or transmit, but must not retain references to the
//! event past return; the caller releases the slot immediately after.

use anyhow::Result;
use tracing::trace;

use crate::pool::Event;

/// Downstream consumer of accepted events.
pub trait StorageSink: Send + Sync {
    /// Sink name for logging.
    fn name(&self) -> &str;

    /// Hand off one accepted event; returns bytes written downstream.
    fn send(&self, event: &Event) -> Result<usize>;
}

/// Event record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Per-fragment record header size in bytes.
pub const FRAGMENT_RECORD_SIZE: usize = 4;

/// Fragment kind tags in the serialized record.
pub const KIND_L0: u8 = 0;
pub const KIND_LKR: u8 = 1;
pub const KIND_LKR_NON_ZS: u8 = 2;

/// Serialize an event into the on-wire storage record: a fixed header
/// followed by one record per fragment.
pub fn serialize_event(event: &Event) -> Vec<u8> {
    let payload_len = event.payload_len();
    let fragment_count =
        event.l0_received() + event.lkr_received() + event.non_zs_received();

    let mut out = Vec::with_capacity(
        RECORD_HEADER_SIZE + fragment_count * FRAGMENT_RECORD_SIZE + payload_len,
    );

    out.extend_from_slice(&event.event_number().to_le_bytes());
    out.extend_from_slice(&event.burst_id().to_le_bytes());
    out.push(event.l1_verdict().unwrap_or(0));
    out.push(event.l2_verdict().unwrap_or(0));
    out.push(event.l0_received() as u8);
    out.push((event.lkr_received() + event.non_zs_received()) as u8);
    out.extend_from_slice(&(payload_len as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 8]); // reserved

    for frag in event.l0_fragments() {
        out.push(frag.source_id());
        out.push(KIND_L0);
        out.extend_from_slice(&(frag.payload_len() as u16).to_le_bytes());
        out.extend_from_slice(frag.payload());
    }

    for frag in event.lkr_fragments() {
        out.push(frag.crate_id());
        out.push(KIND_LKR);
        out.extend_from_slice(&(frag.payload_len() as u16).to_le_bytes());
        out.extend_from_slice(frag.payload());
    }

    for frag in event.non_zs_fragments() {
        out.push(frag.crate_id());
        out.push(KIND_LKR_NON_ZS);
        out.extend_from_slice(&(frag.payload_len() as u16).to_le_bytes());
        out.extend_from_slice(frag.payload());
    }

    out
}

/// Sink that serializes, accounts, and discards. Used when the node runs
/// without a downstream packager attached.
pub struct DiscardSink;

impl StorageSink for DiscardSink {
    fn name(&self) -> &str {
        "discard"
    }

    fn send(&self, event: &Event) -> Result<usize> {
        let record = serialize_event(event);
        trace!(
            event_number = event.event_number(),
            burst_id = event.burst_id(),
            bytes = record.len(),
            "event discarded by storage sink",
        );
        Ok(record.len())
    }
}
