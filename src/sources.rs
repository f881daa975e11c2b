//! Detector source topology.
//!
//! Maps sparse 8-bit source IDs (or calorimeter crate IDs) onto dense
//! indices so event slots can store fragments in flat arrays. The set is
//! fixed at startup from configuration; a fragment naming an ID outside the
//! set fails its whole MEP.

use anyhow::{bail, Result};

/// Immutable set of expected source IDs with dense-index lookup.
#[derive(Debug)]
pub struct SourceTable {
    ids: Vec<u8>,
    index_by_id: [Option<u8>; 256],
}

impl SourceTable {
    /// Build a table from the configured ID set. Duplicates are rejected.
    pub fn new(ids: &[u8]) -> Result<Self> {
        if ids.is_empty() {
            bail!("source ID set must not be empty");
        }

        let mut sorted: Vec<u8> = ids.to_vec();
        sorted.sort_unstable();

        let mut index_by_id = [None; 256];
        for (i, &id) in sorted.iter().enumerate() {
            if index_by_id[id as usize].is_some() {
                bail!("duplicate source ID {id:#04x}");
            }
            index_by_id[id as usize] = Some(i as u8);
        }

        Ok(Self {
            ids: sorted,
            index_by_id,
        })
    }

    /// Number of expected sources; the full-set size for the event join.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether `id` belongs to the expected set.
    pub fn contains(&self, id: u8) -> bool {
        self.index_by_id[id as usize].is_some()
    }

    /// Dense index of `id`, or `None` for an unknown ID.
    pub fn index_of(&self, id: u8) -> Option<usize> {
        self.index_by_id[id as usize].map(usize::from)
    }

    /// Source ID at a dense index.
    pub fn id_at(&self, index: usize) -> Option<u8> {
        self.ids.get(index).copied()
    }

    /// All IDs in ascending order.
    pub fn ids(&self) -> &[u8] {
        &self.ids
    }
}
