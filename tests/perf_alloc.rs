//! Allocation discipline of the parse hot paths.
//!
//! MEP parsing runs once per datagram at line rate; it should allocate
//! only the fragment vector, never per-fragment buffers (fragments are
//! views into the shared datagram buffer).

use std::alloc::System;
use std::hint::black_box;

use farmnode::mep::{l0, lkr, MepBuffer};
use farmnode::sources::SourceTable;
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn l0_mep_bytes(source_id: u8, first_en: u32, events: usize, payload: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for i in 0..events {
        let length = (l0::FRAGMENT_HEADER_SIZE + payload) as u16;
        body.extend_from_slice(&length.to_le_bytes());
        body.push((first_en.wrapping_add(i as u32) & 0xFF) as u8);
        body.push(0);
        body.extend_from_slice(&vec![0xAB; payload]);
    }

    let mut mep = Vec::new();
    mep.push(source_id);
    mep.push(l0::VERSION);
    mep.extend_from_slice(&(events as u16).to_le_bytes());
    mep.extend_from_slice(&((l0::HEADER_SIZE + body.len()) as u16).to_le_bytes());
    mep.extend_from_slice(&[0u8; 2]);
    mep.extend_from_slice(&first_en.to_le_bytes());
    mep.extend_from_slice(&body);
    mep
}

fn lkr_mep_bytes(crate_ids: &[u8], en: u32, payload: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for &crate_id in crate_ids {
        let length = (lkr::FRAGMENT_HEADER_SIZE + payload) as u16;
        body.extend_from_slice(&length.to_le_bytes());
        body.push(crate_id);
        body.push(0);
        body.extend_from_slice(&en.to_le_bytes());
        body.extend_from_slice(&vec![0xCD; payload]);
    }

    let mut mep = Vec::new();
    mep.push(crate_ids.len() as u8);
    mep.push(lkr::VERSION);
    mep.extend_from_slice(&((lkr::HEADER_SIZE + body.len()) as u16).to_le_bytes());
    mep.extend_from_slice(&[0u8; 4]);
    mep.extend_from_slice(&body);
    mep
}

fn allocations_of<T>(f: impl FnOnce() -> T) -> (T, usize) {
    let region = Region::new(&GLOBAL);
    let out = f();
    let stats = region.change();
    (out, stats.allocations)
}

#[test]
#[serial]
fn l0_parse_allocates_only_the_fragment_vector() {
    let sources = SourceTable::new(&[0x04]).expect("sources");
    let raw = l0_mep_bytes(0x04, 500, 16, 64);
    let len = raw.len();
    let buf = MepBuffer::new(raw);

    // Warm up to rule out one-time allocator effects.
    black_box(l0::parse(&buf, 0, len, &sources).expect("parse"));

    let (mep, allocations) = allocations_of(|| l0::parse(&buf, 0, len, &sources).expect("parse"));

    assert_eq!(mep.event_count(), 16);
    assert!(
        allocations <= 1,
        "L0 parse made {allocations} allocations; expected at most the fragment vector"
    );
}

#[test]
#[serial]
fn lkr_parse_allocates_only_the_fragment_vector() {
    let crates = SourceTable::new(&[0x00, 0x01, 0x02, 0x03]).expect("crates");
    let raw = lkr_mep_bytes(&[0x00, 0x01, 0x02, 0x03], 500, 128);
    let len = raw.len();
    let buf = MepBuffer::new(raw);

    black_box(lkr::parse(&buf, 0, len, &crates).expect("parse"));

    let (mep, allocations) =
        allocations_of(|| lkr::parse(&buf, 0, len, &crates).expect("parse"));

    assert_eq!(mep.event_count(), 4);
    assert!(
        allocations <= 1,
        "LKr parse made {allocations} allocations; expected at most the fragment vector"
    );
}

#[test]
#[serial]
fn dropping_fragments_frees_no_intermediate_buffers() {
    let sources = SourceTable::new(&[0x04]).expect("sources");
    let raw = l0_mep_bytes(0x04, 500, 8, 32);
    let len = raw.len();
    let buf = MepBuffer::new(raw);

    let mep = l0::parse(&buf, 0, len, &sources).expect("parse");
    let fragments = mep.into_fragments();

    let region = Region::new(&GLOBAL);
    drop(fragments);
    let stats = region.change();

    // Fragments are views; dropping them must not allocate, and the only
    // deallocation is the vector itself (the buffer is still held here).
    assert_eq!(stats.allocations, 0);
    assert_eq!(buf.handle_count(), 1);
}
