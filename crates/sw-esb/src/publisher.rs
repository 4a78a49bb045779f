//! Outbound bridge: queued messages onto the bus.
//!
//! The bus allows one logged-in producer, so a single publisher worker
//! drains a shared queue. Sends are throttled to a minimum interval unless
//! the subtype is exempt; a throttled message is dropped, not delayed.
//! Sequence numbers are stamped only on messages that actually go out, so
//! the peer sees a gapless strictly-increasing sequence.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use sw_store::MetricsStore;

use crate::client::EsbProducer;
use crate::envelope::{EsbMeta, EsbOutboundMessage, OutboundEnvelope};

/// Metrics bucket for outbound sends.
const PUBLISH_SUBSYSTEM: &str = "iis_publish";

/// Shared receiver side of the outbound queue.
pub type OutboundQueue = Arc<Mutex<mpsc::Receiver<EsbOutboundMessage>>>;

/// Send-frequency throttle. Any allowed send, exempt or not, resets the
/// interval clock.
pub struct PublishGate {
    min_interval: Duration,
    exempt: HashSet<String>,
    last_sent: StdMutex<Option<Instant>>,
}

impl PublishGate {
    pub fn new(min_interval: Duration, exempt: impl IntoIterator<Item = String>) -> Self {
        Self {
            min_interval,
            exempt: exempt.into_iter().collect(),
            last_sent: StdMutex::new(None),
        }
    }

    pub fn should_send(&self, subtype: &str) -> bool {
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock().unwrap();

        let allowed = self.exempt.contains(subtype)
            || last_sent
                .map(|last| now.duration_since(last) >= self.min_interval)
                .unwrap_or(true);

        if allowed {
            *last_sent = Some(now);
        }
        allowed
    }
}

/// The single outbound worker.
pub struct EsbPublisher {
    producer: Arc<dyn EsbProducer>,
    sender_id: String,
    origin_airport: String,
    gate: PublishGate,
    /// Shared across respawns so the sequence survives a worker restart.
    sequence: Arc<AtomicU64>,
    metrics: Arc<dyn MetricsStore>,
}

impl EsbPublisher {
    pub fn new(
        producer: Arc<dyn EsbProducer>,
        sender_id: impl Into<String>,
        origin_airport: impl Into<String>,
        gate: PublishGate,
        sequence: Arc<AtomicU64>,
        metrics: Arc<dyn MetricsStore>,
    ) -> Self {
        Self {
            producer,
            sender_id: sender_id.into(),
            origin_airport: origin_airport.into(),
            gate,
            sequence,
            metrics,
        }
    }

    /// Fresh sequence counter, starting at 1.
    pub fn new_sequence() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(1))
    }

    /// Drain the outbound queue until it closes.
    pub async fn run(&self, queue: OutboundQueue) {
        loop {
            let message = {
                let mut receiver = queue.lock().await;
                receiver.recv().await
            };

            let Some(message) = message else {
                debug!("outbound queue closed, publisher exiting");
                break;
            };

            self.publish(message).await;
        }
    }

    /// Publish one message: throttle check, sequence stamp, serialize, send.
    pub async fn publish(&self, message: EsbOutboundMessage) {
        if !self.gate.should_send(&message.subtype) {
            debug!(subtype = %message.subtype, "send frequency exceeded, dropping message");
            return;
        }

        let mut meta = EsbMeta::new(
            &self.sender_id,
            &self.origin_airport,
            &message.msg_type,
            &message.subtype,
        );
        meta.seqn = Some(self.sequence.fetch_add(1, Ordering::SeqCst));

        let envelope = OutboundEnvelope {
            meta,
            body: message.body,
        };

        let xml = match envelope.to_xml() {
            Ok(xml) => xml,
            Err(e) => {
                error!(subtype = %envelope.meta.styp, error = %e, "outbound serialization failed");
                return;
            }
        };

        match self.producer.publish(xml.as_bytes()).await {
            Ok(()) => {
                debug!(
                    subtype = %envelope.meta.styp,
                    seqn = envelope.meta.seqn,
                    "published to esb"
                );
                if let Err(e) = self.metrics.increment(PUBLISH_SUBSYSTEM).await {
                    warn!(error = %e, "failed to record publish metrics");
                }
            }
            Err(e) => {
                error!(subtype = %envelope.meta.styp, error = %e, "esb publish failed, message dropped");
            }
        }
    }
}
