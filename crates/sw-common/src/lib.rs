use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod topics;

// ============================================================================
// Core Message Types
// ============================================================================

/// The unit delivered by the transport. Created by the connection manager,
/// consumed exactly once by a dispatcher.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Subsystem owning this envelope: the first topic segment.
    pub fn subsystem(&self) -> &str {
        self.topic.split('/').next().unwrap_or_default()
    }
}

/// Decoded message tree handed to a handler. JSON subsystems decode directly;
/// the ESB path maps its XML envelope onto the same shape.
pub type ParsedMessage = serde_json::Value;

/// Walk a nested key path into a parsed message.
///
/// Mirrors the `{msg: {head, body: {<entity>: ...}}}` envelope convention:
/// handlers pick the entity sub-object out of the full tree.
pub fn nested_value<'a>(root: &'a ParsedMessage, path: &[&str]) -> Option<&'a ParsedMessage> {
    let mut current = root;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keepalive_secs: u64,
    /// Force a reconnect when no message arrives for this long, even if the
    /// transport still reports the session alive.
    pub idle_reconnect_secs: u64,
    /// Messages published once after every successful (re)connection.
    pub init_requests: Vec<InitRequest>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "sw-receiver".to_string(),
            keepalive_secs: 65,
            idle_reconnect_secs: 120,
            init_requests: Vec::new(),
        }
    }
}

/// An initialization message published after (re)connecting to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub redis_url: String,
    /// TTL of the dedup lock: the at-most-once window.
    pub dedup_ttl_secs: u64,
    /// TTL applied to a day's metrics hash on its first increment.
    pub metrics_expire_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            dedup_ttl_secs: 300,
            metrics_expire_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsbConfig {
    pub uri: String,
    pub inbound_queue: String,
    pub outbound_exchange: String,
    pub outbound_routing_key: String,
    /// META.SNDR on every outbound envelope.
    pub sender_id: String,
    /// META.APOT: origin airport code.
    pub origin_airport: String,
    /// Minimum interval between outbound publishes.
    pub min_publish_interval_ms: u64,
    /// Subtypes exempt from the publish-frequency throttle.
    pub frequency_exempt_subtypes: Vec<String>,
    /// REQE request codes sent when the bridge starts.
    pub initial_request_codes: Vec<String>,
    /// Bound of the outbound message queue.
    pub outbound_queue_capacity: usize,
}

impl Default for EsbConfig {
    fn default() -> Self {
        Self {
            uri: "amqp://127.0.0.1:5672/%2f".to_string(),
            inbound_queue: "iis.inbound".to_string(),
            outbound_exchange: "iis.outbound".to_string(),
            outbound_routing_key: "smp.iis".to_string(),
            sender_id: "T3SIP".to_string(),
            origin_airport: "ZUGY".to_string(),
            min_publish_interval_ms: 1_000,
            frequency_exempt_subtypes: Vec::new(),
            initial_request_codes: Vec::new(),
            outbound_queue_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Base URL the per-entity suffixes are joined onto.
    pub base_url: String,
    /// Connection lifetime before forced rotation.
    pub max_age_secs: u64,
    /// Rotate this long before max age so a connection is never used at the
    /// edge of its lifetime.
    pub safety_margin_secs: u64,
    /// Give up on an unresponsive endpoint after this long.
    pub connect_timeout_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8000/ws".to_string(),
            max_age_secs: 3_600,
            safety_margin_secs: 30,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Liveness check cadence.
    pub poll_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Handler concurrency budget within one worker. Bounds how many handlers
    /// run at once without ever stalling the fetch loop.
    pub handler_concurrency: usize,
    /// Capacity of each registration's envelope queue.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_concurrency: 4,
            queue_capacity: 1_000,
        }
    }
}

/// Top-level configuration, constructed once at process start and passed down
/// to the connection manager, supervisor and dispatchers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
    pub esb: EsbConfig,
    pub fanout: FanoutConfig,
    pub supervisor: SupervisorConfig,
    pub dispatch: DispatchConfig,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("payload parse failed: {0}")]
    Parse(String),

    #[error("invalid message field: {0}")]
    InvalidField(String),

    #[error("unknown device code: {0}")]
    UnknownDevice(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("lock busy: {0}")]
    LockBusy(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handler error: {0}")]
    Handler(String),
}

impl DispatchError {
    /// Expected business conditions: contained at the dispatcher boundary,
    /// logged at warning level without a backtrace.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            DispatchError::Parse(_)
                | DispatchError::InvalidField(_)
                | DispatchError::UnknownDevice(_)
                | DispatchError::Duplicate(_)
                | DispatchError::LockBusy(_)
                | DispatchError::QueueFull(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_value_walks_message_envelope() {
        let msg = json!({"msg": {"head": {}, "body": {"device": {"code": "C01"}}}});

        let device = nested_value(&msg, &["msg", "body", "device"]).unwrap();
        assert_eq!(device["code"], "C01");

        assert!(nested_value(&msg, &["msg", "body", "event"]).is_none());
    }

    #[test]
    fn envelope_subsystem_is_first_topic_segment() {
        let envelope = Envelope::new("vms/device/add", &b"{}"[..]);
        assert_eq!(envelope.subsystem(), "vms");

        let bare = Envelope::new("acs", &b"{}"[..]);
        assert_eq!(bare.subsystem(), "acs");
    }

    #[test]
    fn business_errors_are_classified() {
        assert!(DispatchError::Parse("bad json".into()).is_business());
        assert!(DispatchError::Duplicate("entry".into()).is_business());
        assert!(!DispatchError::Store("down".into()).is_business());
        assert!(!DispatchError::Handler("boom".into()).is_business());
    }
}
