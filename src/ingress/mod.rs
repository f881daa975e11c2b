//! Packet ingress: ring polling workers.
//!
//! Each worker owns one slice of the receive ring and polls it
//! non-blocking; an empty ring backs off exponentially from 1 µs to 10 ms
//! and any received frame resets the backoff. Per-frame work runs
//! synchronously on the polling task, so a frame is single-threaded from
//! ingress through verdict while frames on different workers proceed in
//! parallel.

pub mod arp;
pub mod frame;
pub mod reassembly;

#[cfg(feature = "afpacket")]
pub mod afpacket;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::Pipeline;

/// Backoff floor when the ring runs dry.
pub const INITIAL_BACKOFF: Duration = Duration::from_micros(1);

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// One slice of the NIC receive ring. Implementations must not block in
/// `poll`; dropping is preferable to queueing.
pub trait FrameRing: Send {
    /// Next captured frame, if one is ready.
    fn poll(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Transmit a frame on this slice (ARP replies).
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Polling worker bound to one ring slice.
pub struct Worker {
    id: usize,
    ring: Box<dyn FrameRing>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    max_poll_errors: u32,
}

impl Worker {
    pub fn new(
        id: usize,
        ring: Box<dyn FrameRing>,
        pipeline: Arc<Pipeline>,
        cancel: CancellationToken,
        max_poll_errors: u32,
    ) -> Self {
        Self {
            id,
            ring,
            pipeline,
            cancel,
            max_poll_errors,
        }
    }

    /// Poll until cancelled. Returns an error only when the ring fails
    /// `max_poll_errors` times in a row; in-flight events are simply
    /// abandoned on shutdown.
    pub async fn run(mut self) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut consecutive_errors: u32 = 0;

        info!(worker = self.id, "ingress worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.ring.poll() {
                Ok(Some(frame)) => {
                    backoff = INITIAL_BACKOFF;
                    consecutive_errors = 0;

                    if let Some(reply) = self.pipeline.handle_frame(frame) {
                        if let Err(e) = self.ring.send(&reply) {
                            warn!(worker = self.id, error = %e, "reply transmit failed");
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.max_poll_errors {
                        return Err(e).with_context(|| {
                            format!(
                                "worker {} ring poll failed {} times in a row",
                                self.id, consecutive_errors
                            )
                        });
                    }

                    debug!(worker = self.id, error = %e, "ring poll error");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!(worker = self.id, "ingress worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::Config;
    use crate::stats::DropReason;

    /// Ring fed from a script of poll results.
    struct ScriptedRing {
        script: VecDeque<io::Result<Option<Vec<u8>>>>,
        sent: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
    }

    impl FrameRing for ScriptedRing {
        fn poll(&mut self) -> io::Result<Option<Vec<u8>>> {
            self.script.pop_front().unwrap_or(Ok(None))
        }

        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.sent.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn test_pipeline() -> Arc<Pipeline> {
        let mut cfg = Config::default();
        cfg.network.host_ip = std::net::Ipv4Addr::new(10, 0, 0, 42);
        Arc::new(Pipeline::with_defaults(&cfg).expect("pipeline"))
    }

    #[tokio::test]
    async fn test_worker_processes_frames_then_idles_until_cancel() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();

        // One junk frame (runt), then an empty ring forever.
        let ring = ScriptedRing {
            script: VecDeque::from([Ok(Some(vec![0u8; 5]))]),
            sent: Arc::new(parking_lot::Mutex::new(Vec::new())),
        };

        let worker = Worker::new(0, Box::new(ring), Arc::clone(&pipeline), cancel.clone(), 3);
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.expect("join").expect("worker result");

        assert_eq!(pipeline.counters().frames_received(), 1);
        assert_eq!(
            pipeline.counters().drop_count(DropReason::MalformedFrame),
            1
        );
    }

    #[tokio::test]
    async fn test_worker_fatal_after_repeated_poll_errors() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();

        let script: VecDeque<io::Result<Option<Vec<u8>>>> = (0..4)
            .map(|_| Err(io::Error::new(io::ErrorKind::Other, "ring gone")))
            .collect();
        let ring = ScriptedRing {
            script,
            sent: Arc::new(parking_lot::Mutex::new(Vec::new())),
        };

        let worker = Worker::new(1, Box::new(ring), pipeline, cancel, 3);
        let err = worker.run().await.unwrap_err();
        assert!(err.to_string().contains("3 times in a row"));
    }
}
