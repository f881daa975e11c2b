//! IP-level fragment reassembly.
//!
//! Datagrams larger than the farm MTU arrive as IPv4 fragments and must be
//! stitched back together before any MEP parsing. The table is keyed by
//! `(src_ip, ident, protocol)` and bounded two ways: entries time out, and
//! when the table is full the oldest partial datagram is evicted. A lost
//! fragment therefore costs one datagram, never memory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::frame::{FragmentInfo, FragmentKey, ETH_HEADER_SIZE};

/// Result of offering one fragment to the table.
pub struct InsertResult {
    /// The rebuilt frame, when this fragment completed its datagram.
    pub reassembled: Option<Vec<u8>>,
    /// Partial datagrams evicted (timeout or capacity) during this call.
    pub evicted: usize,
}

struct Pending {
    /// (datagram offset, payload bytes) per received fragment.
    parts: Vec<(usize, Vec<u8>)>,
    /// Ethernet+IP header captured from the offset-zero fragment.
    header: Option<Vec<u8>>,
    /// Full IP payload length, known once the final fragment arrives.
    total_len: Option<usize>,
    created: Instant,
}

impl Pending {
    fn new(created: Instant) -> Self {
        Self {
            parts: Vec::with_capacity(4),
            header: None,
            total_len: None,
            created,
        }
    }

    fn is_complete(&self) -> bool {
        let Some(total) = self.total_len else {
            return false;
        };
        if self.header.is_none() {
            return false;
        }

        let mut parts: Vec<(usize, usize)> =
            self.parts.iter().map(|(off, p)| (*off, p.len())).collect();
        parts.sort_unstable();

        let mut covered = 0usize;
        for (off, len) in parts {
            if off > covered {
                return false; // hole
            }
            covered = covered.max(off + len);
        }
        covered >= total
    }
}

/// Bounded reassembly table shared by all workers.
pub struct FragmentTable {
    inner: Mutex<HashMap<FragmentKey, Pending>>,
    max_pending: usize,
    timeout: Duration,
}

impl FragmentTable {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_pending,
            timeout,
        }
    }

    /// Number of datagrams currently under reassembly.
    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }

    /// Offer one fragment (the captured frame plus its classification).
    /// When the datagram completes, the returned frame carries the original
    /// Ethernet+IP header with the fragment fields cleared and the total
    /// length fixed up, ready to be classified again.
    pub fn insert(&self, frame: &[u8], info: &FragmentInfo) -> InsertResult {
        let now = Instant::now();
        let mut table = self.inner.lock();
        let mut evicted = 0;

        // Expire stale partials.
        let timeout = self.timeout;
        let before = table.len();
        table.retain(|_, pending| now.duration_since(pending.created) <= timeout);
        evicted += before - table.len();

        // Make room if a new key would overflow the table.
        if !table.contains_key(&info.key) && table.len() >= self.max_pending {
            if let Some(oldest) = table
                .iter()
                .min_by_key(|(_, p)| p.created)
                .map(|(k, _)| *k)
            {
                table.remove(&oldest);
                evicted += 1;
            }
        }

        let pending = table
            .entry(info.key)
            .or_insert_with(|| Pending::new(now));

        let payload_end = (info.payload_offset + info.payload_len).min(frame.len());
        let payload = frame[info.payload_offset..payload_end].to_vec();

        if info.offset == 0 {
            pending.header = Some(frame[..info.payload_offset].to_vec());
        }
        if !info.more_fragments {
            pending.total_len = Some(info.offset + payload.len());
        }
        pending.parts.push((info.offset, payload));

        if !pending.is_complete() {
            return InsertResult {
                reassembled: None,
                evicted,
            };
        }

        let pending = table.remove(&info.key).expect("entry just inserted");
        InsertResult {
            reassembled: Some(rebuild(pending)),
            evicted,
        }
    }
}

/// Stitch a complete datagram back into a single frame.
fn rebuild(pending: Pending) -> Vec<u8> {
    let header = pending.header.expect("checked by is_complete");
    let total = pending.total_len.expect("checked by is_complete");
    let ihl = header.len() - ETH_HEADER_SIZE;

    let mut payload = vec![0u8; total];
    for (offset, part) in &pending.parts {
        let end = (offset + part.len()).min(total);
        payload[*offset..end].copy_from_slice(&part[..end - offset]);
    }

    let mut frame = header;
    // Fix up total length, clear fragment fields, void the stale checksum.
    let total_len = (ihl + total) as u16;
    frame[ETH_HEADER_SIZE + 2..ETH_HEADER_SIZE + 4].copy_from_slice(&total_len.to_be_bytes());
    frame[ETH_HEADER_SIZE + 6..ETH_HEADER_SIZE + 8].copy_from_slice(&[0, 0]);
    frame[ETH_HEADER_SIZE + 10..ETH_HEADER_SIZE + 12].copy_from_slice(&[0, 0]);
    frame.extend_from_slice(&payload);
    frame
}
