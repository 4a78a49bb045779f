//! Topic dispatcher worker.
//!
//! Each worker drains one registration's envelope queue. The fetch loop
//! never runs a handler inline: processing is submitted under a small
//! semaphore budget so a slow handler can delay other handlers but never
//! message intake. Every failure mode is contained here; a worker loop only
//! exits when its queue closes during shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, warn};

use sw_common::{DispatchError, Envelope, ParsedMessage, Result};
use sw_store::{fingerprint, DedupLock, MetricsStore};

use crate::registry::HandlerRegistry;

/// Shared receiver side of a registration's queue. Multiple workers of the
/// same registration take turns on the lock; `recv` blocks until a message
/// is available.
pub type EnvelopeQueue = Arc<Mutex<mpsc::Receiver<Envelope>>>;

/// How a worker decodes envelopes and names their handlers. Topic workers
/// derive names from the topic; the foreign-bus worker derives them from a
/// field inside the payload.
pub trait MessageShape: Send + Sync {
    fn parse(&self, envelope: &Envelope) -> Result<ParsedMessage>;

    fn handler_name(&self, envelope: &Envelope, parsed: &ParsedMessage) -> Result<String>;

    /// Subsystem charged in the metrics store for this envelope.
    fn subsystem(&self, envelope: &Envelope) -> String;
}

/// JSON envelopes on MQ topics: `{msg: {head, body: {...}}}`.
pub struct JsonTopicShape;

impl MessageShape for JsonTopicShape {
    fn parse(&self, envelope: &Envelope) -> Result<ParsedMessage> {
        serde_json::from_slice(&envelope.payload)
            .map_err(|e| DispatchError::Parse(format!("json decode failed: {e}")))
    }

    fn handler_name(&self, envelope: &Envelope, _parsed: &ParsedMessage) -> Result<String> {
        Ok(crate::registry::derive_topic_handler_name(&envelope.topic))
    }

    fn subsystem(&self, envelope: &Envelope) -> String {
        envelope.subsystem().to_string()
    }
}

/// Distributed dedup applied before each handler invocation.
pub struct DedupGuard {
    pub lock: Arc<dyn DedupLock>,
    pub ttl: Duration,
}

/// Per-worker dispatch engine: parse, resolve, invoke, classify, count.
pub struct Dispatcher {
    worker_id: String,
    shape: Arc<dyn MessageShape>,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<dyn MetricsStore>,
    dedup: Option<DedupGuard>,
    concurrency: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        worker_id: impl Into<String>,
        shape: Arc<dyn MessageShape>,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<dyn MetricsStore>,
        dedup: Option<DedupGuard>,
        handler_concurrency: usize,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            shape,
            registry,
            metrics,
            dedup,
            concurrency: Arc::new(Semaphore::new(handler_concurrency.max(1))),
        }
    }

    /// Drain the queue until it closes. Fetching the next envelope waits for
    /// a concurrency permit but never for handler completion.
    pub async fn run(self: Arc<Self>, queue: EnvelopeQueue) {
        loop {
            let envelope = {
                let mut receiver = queue.lock().await;
                receiver.recv().await
            };

            let Some(envelope) = envelope else {
                // Queue closed: the process is shutting down.
                debug!(worker = %self.worker_id, "envelope queue closed, worker exiting");
                break;
            };

            self.submit(envelope).await;
        }
    }

    /// Process an envelope on its own task under the concurrency budget.
    /// Waits for a permit, never for the handler.
    pub async fn submit(self: &Arc<Self>, envelope: Envelope) {
        let permit = match self.concurrency.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.process(envelope).await;
            drop(permit);
        });
    }

    /// Process one envelope end to end. Never returns an error: all failure
    /// modes are classified and contained here.
    pub async fn process(&self, envelope: Envelope) {
        if let Some(guard) = &self.dedup {
            let key = fingerprint(&envelope.payload);
            match guard.lock.try_acquire(&key, guard.ttl).await {
                Ok(true) => {
                    debug!(worker = %self.worker_id, "dedup lock acquired, processing");
                }
                Ok(false) => {
                    debug!(worker = %self.worker_id, topic = %envelope.topic, "duplicate delivery, discarding");
                    return;
                }
                Err(e) => {
                    error!(
                        worker = %self.worker_id,
                        topic = %envelope.topic,
                        error = %e,
                        "dedup lock store unreachable, discarding message"
                    );
                    return;
                }
            }
        }

        match self.dispatch(&envelope).await {
            Ok(true) => self.record_metrics(&envelope).await,
            Ok(false) => {
                // No handler claimed the name: no-op, no metrics.
            }
            Err(e) if e.is_business() => {
                warn!(
                    worker = %self.worker_id,
                    topic = %envelope.topic,
                    error = %e,
                    "message dropped"
                );
            }
            Err(e) => {
                error!(
                    worker = %self.worker_id,
                    topic = %envelope.topic,
                    raw = %String::from_utf8_lossy(&envelope.payload),
                    error = %e,
                    "unexpected dispatch failure"
                );
            }
        }
    }

    /// Parse, resolve and invoke. Returns whether a handler claimed the
    /// message.
    async fn dispatch(&self, envelope: &Envelope) -> Result<bool> {
        let parsed = self.shape.parse(envelope)?;
        let handler_name = self.shape.handler_name(envelope, &parsed)?;

        let Some(handler) = self.registry.resolve(&handler_name) else {
            debug!(worker = %self.worker_id, handler = %handler_name, "no handler registered, skipping");
            return Ok(false);
        };

        debug!(worker = %self.worker_id, handler = %handler_name, topic = %envelope.topic, "dispatching");
        handler.handle(parsed).await?;
        Ok(true)
    }

    /// Best-effort: a metrics failure never surfaces to the message path.
    async fn record_metrics(&self, envelope: &Envelope) {
        let subsystem = self.shape.subsystem(envelope);
        if let Err(e) = self.metrics.increment(&subsystem).await {
            warn!(
                worker = %self.worker_id,
                subsystem = %subsystem,
                error = %e,
                "failed to record message metrics"
            );
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}
