//! Event-building and trigger pipeline for a DAQ farm worker node.
//!
//! Front-end electronics emit UDP multi-event packets (MEPs) on a local
//! network. This crate reassembles physics events from fragments arriving
//! across many source subsystems, runs the L1 and L2 software trigger
//! stages, and hands accepted events to a storage sink. Everything between
//! the NIC ring and the sink lives here; option parsing, metrics endpoints
//! and on-disk packaging are external.

pub mod builder;
pub mod burst;
pub mod config;
pub mod ingress;
pub mod mep;
pub mod node;
pub mod pool;
pub mod sources;
pub mod stats;
pub mod storage;
