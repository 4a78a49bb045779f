//! Realtime websocket fanout.
//!
//! Handlers push updates to per-entity websocket endpoints. Connections are
//! pooled by endpoint and rotated before their server-side lifetime runs
//! out, with a safety margin so a connection is never used at the edge of
//! expiry. Delivery is strictly best-effort: a connect or send failure is
//! logged and the message dropped, the message path never sees an error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Local;
use futures::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

use sw_common::FanoutConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Mark a message as coming from this service, with its send time.
pub fn decorate_message(message: &mut Value) {
    if let Value::Object(fields) = message {
        fields.insert("publisher".to_string(), Value::Bool(true));
        fields.insert(
            "send_time".to_string(),
            Value::String(Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        );
    }
}

/// When a connection opened at `opened` must be rotated.
pub fn rotation_deadline(opened: Instant, max_age: Duration, margin: Duration) -> Instant {
    opened + max_age.saturating_sub(margin)
}

struct PooledConnection {
    stream: WsStream,
    rotate_at: Instant,
}

/// Endpoint-keyed connection pool. Not shared across tasks; each worker
/// that fans out owns its own pool.
pub struct WebSocketFanout {
    base_url: String,
    max_age: Duration,
    safety_margin: Duration,
    connect_timeout: Duration,
    connections: HashMap<String, PooledConnection>,
}

impl WebSocketFanout {
    pub fn new(config: &FanoutConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_age: Duration::from_secs(config.max_age_secs),
            safety_margin: Duration::from_secs(config.safety_margin_secs),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            connections: HashMap::new(),
        }
    }

    pub fn endpoint(&self, suffix: &str) -> String {
        format!("{}/{}", self.base_url, suffix.trim_start_matches('/'))
    }

    /// Send a message to the endpoint for `suffix`. Never returns an error;
    /// all failures are logged and the message dropped.
    pub async fn publish(&mut self, suffix: &str, mut message: Value) {
        decorate_message(&mut message);
        let url = self.endpoint(suffix);

        self.rotate_if_due(&url).await;

        if !self.connections.contains_key(&url) {
            match timeout(self.connect_timeout, connect_async(&url)).await {
                Ok(Ok((stream, _))) => {
                    debug!(url = %url, "websocket connected");
                    self.connections.insert(
                        url.clone(),
                        PooledConnection {
                            stream,
                            rotate_at: rotation_deadline(
                                Instant::now(),
                                self.max_age,
                                self.safety_margin,
                            ),
                        },
                    );
                }
                Ok(Err(e)) => {
                    error!(url = %url, error = %e, "websocket connect failed, message dropped");
                    return;
                }
                Err(_) => {
                    error!(url = %url, timeout_ms = self.connect_timeout.as_millis() as u64,
                        "websocket connect timed out, message dropped");
                    return;
                }
            }
        }

        let Some(connection) = self.connections.get_mut(&url) else {
            return;
        };

        if let Err(e) = connection
            .stream
            .send(Message::Text(message.to_string()))
            .await
        {
            error!(url = %url, error = %e, "websocket send failed, closing connection");
            self.connections.remove(&url);
        }
    }

    async fn rotate_if_due(&mut self, url: &str) {
        let due = self
            .connections
            .get(url)
            .map(|c| Instant::now() >= c.rotate_at)
            .unwrap_or(false);
        if !due {
            return;
        }

        if let Some(mut stale) = self.connections.remove(url) {
            debug!(url = url, "websocket connection aged out, rotating");
            let _ = stale.stream.close(None).await;
        }
    }

    pub fn pooled_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> FanoutConfig {
        FanoutConfig {
            base_url: "ws://127.0.0.1:1/ws".to_string(),
            max_age_secs: 3600,
            safety_margin_secs: 30,
            connect_timeout_ms: 5_000,
        }
    }

    #[test]
    fn decorated_message_carries_publisher_and_send_time() {
        let mut message = json!({ "event": "alarm" });
        decorate_message(&mut message);

        assert_eq!(message["publisher"], true);
        let send_time = message["send_time"].as_str().unwrap();
        assert!(send_time.contains('-') && send_time.contains(':'));
        assert_eq!(message["event"], "alarm");
    }

    #[test]
    fn endpoint_joins_base_and_suffix() {
        let fanout = WebSocketFanout::new(&config());
        assert_eq!(fanout.endpoint("event"), "ws://127.0.0.1:1/ws/event");
        assert_eq!(fanout.endpoint("/event"), "ws://127.0.0.1:1/ws/event");
    }

    #[test]
    fn rotation_happens_before_max_age() {
        let opened = Instant::now();
        let deadline =
            rotation_deadline(opened, Duration::from_secs(3600), Duration::from_secs(30));
        assert_eq!(deadline, opened + Duration::from_secs(3570));
    }

    #[tokio::test]
    async fn connect_failure_is_swallowed() {
        // Port 1 refuses connections; publish must neither error nor panic.
        let mut fanout = WebSocketFanout::new(&config());
        fanout.publish("event", json!({ "event": "alarm" })).await;
        assert_eq!(fanout.pooled_count(), 0);
    }

    #[tokio::test]
    async fn unresponsive_endpoint_times_out() {
        // Accepts TCP but never answers the handshake; publish must return
        // within the connect timeout instead of hanging.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    sockets.push(socket);
                }
            }
        });

        let mut fanout = WebSocketFanout::new(&FanoutConfig {
            base_url: format!("ws://{addr}/ws"),
            connect_timeout_ms: 100,
            ..FanoutConfig::default()
        });

        let started = std::time::Instant::now();
        fanout.publish("event", json!({ "event": "alarm" })).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(fanout.pooled_count(), 0);
    }
}
