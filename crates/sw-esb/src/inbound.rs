//! Inbound bridge: bus messages into the dispatch pipeline.
//!
//! Bus messages carry no topic; the handler name comes from the subtype
//! inside the XML envelope. Everything downstream of decoding is the same
//! dispatcher used for the MQ topics.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use sw_common::{Envelope, Result};
use sw_dispatch::registry::derive_subtype_handler_name;
use sw_dispatch::{Dispatcher, MessageShape};

use crate::client::EsbConsumer;
use crate::envelope::{parse_xml, subtype};

const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// Flight subsystem charged for every inbound bus message.
const INBOUND_SUBSYSTEM: &str = "iis";

/// Payload-addressed XML messages: handler name from `MSG.META.STYP`.
pub struct XmlSubtypeShape;

impl MessageShape for XmlSubtypeShape {
    fn parse(&self, envelope: &Envelope) -> Result<sw_common::ParsedMessage> {
        parse_xml(&envelope.payload)
    }

    fn handler_name(
        &self,
        _envelope: &Envelope,
        parsed: &sw_common::ParsedMessage,
    ) -> Result<String> {
        Ok(derive_subtype_handler_name(&subtype(parsed)?))
    }

    fn subsystem(&self, _envelope: &Envelope) -> String {
        INBOUND_SUBSYSTEM.to_string()
    }
}

/// Drives the consumer and feeds each message through the dispatcher.
pub struct EsbInboundWorker {
    consumer: Arc<dyn EsbConsumer>,
    dispatcher: Arc<Dispatcher>,
}

impl EsbInboundWorker {
    pub fn new(consumer: Arc<dyn EsbConsumer>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            consumer,
            dispatcher,
        }
    }

    /// Receive loop. Messages are submitted under the dispatcher's
    /// concurrency budget so a slow handler never holds up the next
    /// receive. A transport error backs off and retries; it never takes
    /// the worker down.
    pub async fn run(&self) {
        loop {
            match self.consumer.receive().await {
                Ok(payload) => {
                    self.dispatcher
                        .submit(Envelope::new(String::new(), payload))
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "esb receive failed, backing off");
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use sw_common::ParsedMessage;
    use sw_dispatch::{HandlerRegistry, MessageHandler};
    use sw_store::MetricsStore;
    use tokio::sync::Notify;

    struct NullMetrics;

    #[async_trait]
    impl MetricsStore for NullMetrics {
        async fn increment(&self, _subsystem: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Hands out queued messages, counting receives; waits forever once
    /// drained.
    struct ScriptedConsumer {
        messages: StdMutex<Vec<Bytes>>,
        receives: AtomicUsize,
    }

    #[async_trait]
    impl EsbConsumer for ScriptedConsumer {
        async fn receive(&self) -> Result<Bytes> {
            if let Some(message) = self.messages.lock().unwrap().pop() {
                self.receives.fetch_add(1, Ordering::SeqCst);
                return Ok(message);
            }
            std::future::pending().await
        }
    }

    /// Blocks until released, so intake progress is observable while the
    /// handler is still running.
    struct BlockingHandler {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl MessageHandler for BlockingHandler {
        async fn handle(&self, _message: ParsedMessage) -> Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[test]
    fn subtype_maps_to_flight_handler_name() {
        let xml = "<MSG><META><STYP>ARRE</STYP></META><DFLT><FLNO>CA1001</FLNO></DFLT></MSG>";
        let shape = XmlSubtypeShape;
        let envelope = Envelope::new("", xml.as_bytes().to_vec());

        let parsed = shape.parse(&envelope).unwrap();
        assert_eq!(shape.handler_name(&envelope, &parsed).unwrap(), "iis_arre");
        assert_eq!(shape.subsystem(&envelope), "iis");
    }

    #[test]
    fn missing_subtype_is_an_invalid_field() {
        let xml = "<MSG><META><TYPE>DFLT</TYPE></META></MSG>";
        let shape = XmlSubtypeShape;
        let envelope = Envelope::new("", xml.as_bytes().to_vec());

        let parsed = shape.parse(&envelope).unwrap();
        let err = shape.handler_name(&envelope, &parsed).unwrap_err();
        assert!(err.is_business());
    }

    #[tokio::test]
    async fn slow_handler_does_not_block_intake() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let mut registry = HandlerRegistry::new();
        registry.register(
            "iis_arre",
            Arc::new(BlockingHandler {
                started: started.clone(),
                release: release.clone(),
            }),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            "esb-inbound",
            Arc::new(XmlSubtypeShape),
            Arc::new(registry),
            Arc::new(NullMetrics),
            None,
            4,
        ));

        let message = |flight: &str| {
            Bytes::from(format!(
                "<MSG><META><STYP>ARRE</STYP></META><DFLT><FLNO>{flight}</FLNO></DFLT></MSG>"
            ))
        };
        let consumer = Arc::new(ScriptedConsumer {
            messages: StdMutex::new(vec![message("CA1002"), message("CA1001")]),
            receives: AtomicUsize::new(0),
        });

        let worker = EsbInboundWorker::new(consumer.clone(), dispatcher);
        let intake = tokio::spawn(async move { worker.run().await });

        // First handler is parked; the loop must still drain the second
        // message.
        started.notified().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while consumer.receives.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("intake stalled behind a busy handler");

        release.notify_waiters();
        intake.abort();
    }
}
