//! Node orchestration: wires the pipeline together and runs the workers.
//!
//! [`Pipeline`] is the per-frame path from classifier to verdict; it is
//! shared by all workers and owns no thread of its own, which is what the
//! integration tests drive directly. [`Node`] owns the pipeline plus the
//! worker tasks and the periodic stats report.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::builder::{FixedL1, FixedL2, L1Builder, L1Trigger, L2Builder, L2Trigger};
use crate::burst::{BurstTracker, EOB_PAYLOAD_SIZE};
use crate::config::{Config, PortsConfig};
use crate::ingress::frame::{self, FrameClass, FrameError, UdpDatagram};
use crate::ingress::reassembly::FragmentTable;
use crate::ingress::{arp, FrameRing, Worker};
use crate::mep::lkr::LKR_SOURCE_ID;
use crate::mep::{self, MepBuffer};
use crate::pool::EventPool;
use crate::sources::SourceTable;
use crate::stats::{Counters, DropReason};
use crate::storage::{DiscardSink, StorageSink};

/// External consumer of straw-tracker datagrams.
pub trait StrawHandler: Send + Sync {
    fn process(&self, payload: &[u8]);
}

/// Straw handler used when no external receiver is attached.
pub struct NullStrawHandler;

impl StrawHandler for NullStrawHandler {
    fn process(&self, payload: &[u8]) {
        trace!(bytes = payload.len(), "straw datagram discarded");
    }
}

/// The per-frame processing path shared by all workers.
pub struct Pipeline {
    ports: PortsConfig,
    my_ip: Ipv4Addr,
    my_mac: [u8; 6],
    pool: Arc<EventPool>,
    burst: Arc<BurstTracker>,
    counters: Arc<Counters>,
    l1: L1Builder,
    straw: Arc<dyn StrawHandler>,
    fragments: FragmentTable,
}

impl Pipeline {
    /// Build a pipeline with the given trigger stages, storage sink and
    /// straw handler.
    pub fn new(
        cfg: &Config,
        l1_trigger: Arc<dyn L1Trigger>,
        l2_trigger: Arc<dyn L2Trigger>,
        storage: Arc<dyn StorageSink>,
        straw: Arc<dyn StrawHandler>,
    ) -> Result<Self> {
        let sources = Arc::new(
            SourceTable::new(&cfg.sources.l0_source_ids).context("building L0 source table")?,
        );
        let crates = Arc::new(
            SourceTable::new(&cfg.sources.lkr_crate_ids).context("building LKr crate table")?,
        );

        let pool = Arc::new(EventPool::new(
            cfg.event_building.pool_capacity,
            sources.len(),
            crates.len(),
        ));
        let counters = Arc::new(Counters::new());
        let burst = Arc::new(BurstTracker::new(
            cfg.event_building.first_burst_id,
            cfg.event_building.burst_grace,
        ));

        let l2 = Arc::new(L2Builder::new(
            Arc::clone(&pool),
            Arc::clone(&crates),
            Arc::clone(&counters),
            l2_trigger,
            storage,
        ));
        let l1 = L1Builder::new(
            Arc::clone(&pool),
            Arc::clone(&sources),
            Arc::clone(&counters),
            l1_trigger,
            Arc::clone(&l2),
        );

        Ok(Self {
            ports: cfg.ports,
            my_ip: cfg.network.host_ip,
            my_mac: cfg.host_mac_bytes(),
            pool,
            burst,
            counters,
            l1,
            straw,
            fragments: FragmentTable::new(cfg.reassembly.max_pending, cfg.reassembly.timeout),
        })
    }

    /// Pipeline with pass-through triggers and a discarding sink.
    pub fn with_defaults(cfg: &Config) -> Result<Self> {
        Self::new(
            cfg,
            Arc::new(FixedL1(2)),
            Arc::new(FixedL2 {
                normal: 1,
                non_zs: 1,
            }),
            Arc::new(DiscardSink),
            Arc::new(NullStrawHandler),
        )
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    pub fn burst(&self) -> &Arc<BurstTracker> {
        &self.burst
    }

    /// Process one captured frame end to end. Returns a frame to transmit
    /// back on the ring (an ARP reply) when one is due.
    pub fn handle_frame(&self, frame: Vec<u8>) -> Option<Vec<u8>> {
        self.counters.record_frame();
        self.process(frame)
    }

    fn process(&self, frame: Vec<u8>) -> Option<Vec<u8>> {
        match frame::classify(&frame, self.my_ip) {
            Ok(FrameClass::Arp) => arp::reply_for(&frame, self.my_ip, self.my_mac),
            Ok(FrameClass::Fragment(info)) => {
                let result = self.fragments.insert(&frame, &info);
                for _ in 0..result.evicted {
                    self.counters.record_drop(DropReason::ReassemblyEvicted);
                }
                // A completed datagram re-enters classification whole.
                result.reassembled.and_then(|rebuilt| self.process(rebuilt))
            }
            Ok(FrameClass::Udp(dgram)) => {
                self.dispatch(MepBuffer::new(frame), &dgram);
                None
            }
            Err(e) => {
                let reason = match e {
                    FrameError::UnhandledEtherType { .. } | FrameError::NotUdp { .. } => {
                        DropReason::UnhandledProtocol
                    }
                    FrameError::ForeignDestination { .. } => DropReason::ForeignDestination,
                    _ => DropReason::MalformedFrame,
                };
                self.counters.record_drop(reason);
                trace!(error = %e, "frame dropped");
                None
            }
        }
    }

    /// Route a complete datagram by destination port.
    fn dispatch(&self, buf: MepBuffer, dgram: &UdpDatagram) {
        let port = dgram.dst_port;

        if port == self.ports.l0 {
            self.handle_l0_mep(buf, dgram);
        } else if port == self.ports.cream {
            self.handle_lkr_mep(buf, dgram);
        } else if port == self.ports.straw {
            let payload =
                &buf.as_slice()[dgram.payload_offset..dgram.payload_offset + dgram.payload_len];
            self.straw.process(payload);
        } else if port == self.ports.eob_broadcast {
            self.handle_eob(&buf, dgram);
        } else {
            self.counters.record_drop(DropReason::UnknownPort);
            warn!(port, "datagram on unknown UDP port");
        }
    }

    fn handle_l0_mep(&self, buf: MepBuffer, dgram: &UdpDatagram) {
        let frame_len = buf.len() as u64;

        let parsed = mep::l0::parse(
            &buf,
            dgram.payload_offset,
            dgram.payload_len,
            self.l1_sources(),
        );
        let parsed = match parsed {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping L0 MEP");
                self.counters.record_drop(DropReason::MalformedMep);
                return;
            }
        };

        // Small event numbers after the grace period prove the new burst
        // has started; check before admitting these fragments.
        if let Some(new_burst) = self.burst.on_l0_mep(parsed.first_event_number()) {
            self.counters.record_burst_advance();
            info!(burst_id = new_burst, "burst ID advanced");
        }

        self.counters
            .record_mep(parsed.source_id(), parsed.event_count() as u64, frame_len);

        let burst_id = self.burst.current();
        for fragment in parsed.into_fragments() {
            self.l1.build(fragment, burst_id);
        }
    }

    fn handle_lkr_mep(&self, buf: MepBuffer, dgram: &UdpDatagram) {
        let frame_len = buf.len() as u64;

        let parsed = mep::lkr::parse(
            &buf,
            dgram.payload_offset,
            dgram.payload_len,
            self.l2_crates(),
        );
        let parsed = match parsed {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping LKr MEP");
                self.counters.record_drop(DropReason::MalformedMep);
                return;
            }
        };

        self.counters
            .record_mep(LKR_SOURCE_ID, parsed.event_count() as u64, frame_len);

        let burst_id = self.burst.current();
        for fragment in parsed.into_fragments() {
            self.l2().build(fragment, burst_id);
        }
    }

    fn handle_eob(&self, buf: &MepBuffer, dgram: &UdpDatagram) {
        if dgram.payload_len != EOB_PAYLOAD_SIZE {
            warn!(
                size = dgram.payload_len,
                "unrecognizable packet on the EOB broadcast port"
            );
            self.counters.record_drop(DropReason::MalformedEob);
            return;
        }

        let finished = u32::from_le_bytes(
            buf.as_slice()[dgram.payload_offset..dgram.payload_offset + 4]
                .try_into()
                .expect("length checked above"),
        );
        self.burst.on_eob(finished);

        info!(
            finished_burst_id = finished,
            next_burst_id = finished.wrapping_add(1),
            "received EOB broadcast; burst ID will advance",
        );
    }

    fn l1_sources(&self) -> &SourceTable {
        self.l1.sources()
    }

    fn l2_crates(&self) -> &SourceTable {
        self.l1.l2().crates()
    }

    fn l2(&self) -> &L2Builder {
        self.l1.l2()
    }
}

/// A running farm worker node.
pub struct Node {
    cfg: Config,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Node {
    /// Node with pass-through triggers and a discarding sink.
    pub fn new(cfg: Config) -> Result<Self> {
        let pipeline = Arc::new(Pipeline::with_defaults(&cfg)?);
        Ok(Self {
            cfg,
            pipeline,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        })
    }

    /// Node with externally supplied trigger stages and sinks.
    pub fn with_components(
        cfg: Config,
        l1_trigger: Arc<dyn L1Trigger>,
        l2_trigger: Arc<dyn L2Trigger>,
        storage: Arc<dyn StorageSink>,
        straw: Arc<dyn StrawHandler>,
    ) -> Result<Self> {
        let pipeline = Arc::new(Pipeline::new(&cfg, l1_trigger, l2_trigger, storage, straw)?);
        Ok(Self {
            cfg,
            pipeline,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Open the ring slices and start polling.
    pub async fn start(&mut self) -> Result<()> {
        #[cfg(feature = "afpacket")]
        {
            use crate::ingress::afpacket::AfPacketRing;

            // One fanout group per process partitions the flow across
            // workers without a shared consumer queue.
            let fanout_group = (std::process::id() & 0xFFFF) as u16;
            let mut rings: Vec<Box<dyn FrameRing>> = Vec::new();
            for _ in 0..self.cfg.event_building.workers {
                let ring = AfPacketRing::open(&self.cfg.network.interface, Some(fanout_group))
                    .with_context(|| {
                        format!("opening ring on {}", self.cfg.network.interface)
                    })?;
                rings.push(Box::new(ring));
            }
            self.spawn_workers(rings);
        }

        #[cfg(not(feature = "afpacket"))]
        warn!("compiled without the afpacket feature; no ring ingress");

        self.spawn_stats_reporter();

        info!(
            workers = self.cfg.event_building.workers,
            pool_capacity = self.cfg.event_building.pool_capacity,
            first_burst_id = self.cfg.event_building.first_burst_id,
            "node started",
        );

        Ok(())
    }

    /// Attach workers to the given ring slices. Used by `start` and by
    /// tests that inject scripted rings.
    pub fn spawn_workers(&mut self, rings: Vec<Box<dyn FrameRing>>) {
        for (id, ring) in rings.into_iter().enumerate() {
            let worker = Worker::new(
                id,
                ring,
                Arc::clone(&self.pipeline),
                self.cancel.child_token(),
                self.cfg.event_building.max_poll_errors,
            );
            self.workers.push(tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    error!(worker = id, error = %e, "ingress worker exited fatally");
                }
            }));
        }
    }

    /// Start, then block until SIGINT or SIGTERM, then shut down. The
    /// signal watchers live inside the node lifecycle so a node embedded
    /// in another process can skip them and drive `start`/`stop` itself.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        self.start().await?;

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("registering SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for SIGINT")?;
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }

        self.stop().await
    }

    /// Cooperative shutdown: workers stop at their next poll; in-flight
    /// events are discarded and slots are not drained.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }

        info!("node stopped");
        Ok(())
    }

    /// Periodic one-line summary of pipeline health.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let counters = Arc::clone(self.pipeline.counters());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        info!(
                            frames = counters.frames_received(),
                            l1_triggers = counters.l1_total(),
                            l2_triggers = counters.l2_total(),
                            events_to_storage = counters.events_to_storage(),
                            bytes_to_storage = counters.bytes_to_storage(),
                            burst_advances = counters.burst_advances(),
                            "pipeline stats (60s)",
                        );

                        for (reason, count) in counters.drop_snapshot() {
                            debug!(reason = %reason, count, "  drops");
                        }
                    }
                }
            }
        });
    }
}
