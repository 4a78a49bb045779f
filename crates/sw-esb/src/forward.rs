//! Forwarding decorator: mirror handled messages onto the outbound bus.
//!
//! Wraps a business handler; after the inner handler succeeds the message
//! is enqueued for the publisher under a fixed type/subtype. Enqueue
//! failure never fails the handler, the local processing already happened.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use sw_common::{ParsedMessage, Result};
use sw_dispatch::MessageHandler;

use crate::envelope::EsbOutboundMessage;

pub struct ForwardToEsb {
    inner: Arc<dyn MessageHandler>,
    outbound: mpsc::Sender<EsbOutboundMessage>,
    msg_type: String,
    subtype: String,
}

impl ForwardToEsb {
    pub fn new(
        inner: Arc<dyn MessageHandler>,
        outbound: mpsc::Sender<EsbOutboundMessage>,
        msg_type: impl Into<String>,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            outbound,
            msg_type: msg_type.into(),
            subtype: subtype.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for ForwardToEsb {
    async fn handle(&self, message: ParsedMessage) -> Result<()> {
        self.inner.handle(message.clone()).await?;

        let outbound = EsbOutboundMessage {
            msg_type: self.msg_type.clone(),
            subtype: self.subtype.clone(),
            body: json!({ "INFO": message }),
        };

        if let Err(e) = self.outbound.try_send(outbound) {
            warn!(subtype = %self.subtype, error = %e, "outbound queue unavailable, forward dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _message: ParsedMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: ParsedMessage) -> Result<()> {
            Err(sw_common::DispatchError::InvalidField("density".into()))
        }
    }

    #[tokio::test]
    async fn forwards_after_inner_handler_succeeds() {
        let inner = Arc::new(NoopHandler {
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::channel(4);
        let forward = ForwardToEsb::new(inner.clone(), tx, "SIP", "REALTIMECHANNEL");

        forward.handle(json!({ "density": 12 })).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.msg_type, "SIP");
        assert_eq!(queued.subtype, "REALTIMECHANNEL");
        assert_eq!(queued.body["INFO"]["density"], 12);
    }

    #[tokio::test]
    async fn inner_failure_skips_the_forward() {
        let (tx, mut rx) = mpsc::channel(4);
        let forward = ForwardToEsb::new(Arc::new(FailingHandler), tx, "SIP", "REALTIMECHANNEL");

        assert!(forward.handle(json!({})).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_does_not_fail_the_handler() {
        let inner = Arc::new(NoopHandler {
            calls: AtomicUsize::new(0),
        });
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(EsbOutboundMessage {
            msg_type: "SIP".into(),
            subtype: "X".into(),
            body: json!(null),
        })
        .unwrap();

        let forward = ForwardToEsb::new(inner, tx, "SIP", "REALTIMECHANNEL");
        assert!(forward.handle(json!({})).await.is_ok());
    }
}
