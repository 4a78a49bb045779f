//! Broker connection management.
//!
//! A single supervised loop owns the MQTT session: it connects, subscribes
//! the full topic table, replays the configured initialization requests, and
//! routes every inbound publish onto the registration queues. Reconnection
//! is handled here, including the idle watchdog: brokers have been observed
//! to keep a session "alive" while silently delivering nothing, so a
//! connection that stays quiet past the idle limit is torn down and rebuilt
//! rather than trusted.

pub mod init;

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use sw_common::topics::{subscription_table, topic_matches};
use sw_common::{Envelope, MqttConfig};

const POLL_SLICE: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// A registration's subscription patterns paired with its queue sender.
pub struct TopicRoute {
    pub patterns: Vec<String>,
    pub sender: mpsc::Sender<Envelope>,
}

/// Senders whose patterns match the topic. A topic can fan out to several
/// registrations when their patterns overlap.
pub fn route_targets<'a>(routes: &'a [TopicRoute], topic: &str) -> Vec<&'a mpsc::Sender<Envelope>> {
    routes
        .iter()
        .filter(|r| r.patterns.iter().any(|p| topic_matches(p, topic)))
        .map(|r| &r.sender)
        .collect()
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Tracks time since the last inbound message.
pub struct IdleTimer {
    limit: Duration,
    last: StdMutex<Instant>,
}

impl IdleTimer {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            last: StdMutex::new(Instant::now()),
        }
    }

    /// Note inbound activity (or a fresh session).
    pub fn record(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }

    pub fn expired(&self) -> bool {
        self.idle_for() >= self.limit
    }
}

/// Owns the broker session and feeds the registration queues.
pub struct MqttConnectionManager {
    config: MqttConfig,
    routes: Vec<TopicRoute>,
    idle: IdleTimer,
}

impl MqttConnectionManager {
    pub fn new(config: MqttConfig, routes: Vec<TopicRoute>) -> Self {
        let idle = IdleTimer::new(Duration::from_secs(config.idle_reconnect_secs));
        Self {
            config,
            routes,
            idle,
        }
    }

    /// Run the session loop. Never returns under normal operation: every
    /// connection failure and idle expiry falls through to a fresh connect.
    pub async fn run(&self) {
        loop {
            self.run_session().await;
            warn!(
                backoff_secs = RECONNECT_BACKOFF.as_secs(),
                "broker session ended, reconnecting"
            );
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// One connection lifetime: from connect until an error or idle expiry.
    async fn run_session(&self) {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs));
        if !self.config.username.is_empty() {
            options.set_credentials(self.config.username.clone(), self.config.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        self.idle.record();

        loop {
            if self.idle.expired() {
                warn!(
                    idle_secs = self.idle.idle_for().as_secs(),
                    "no messages within idle limit, forcing reconnect"
                );
                return;
            }

            // Poll in short slices so the idle check runs even on a quiet
            // connection.
            match timeout(POLL_SLICE, eventloop.poll()).await {
                Err(_) => continue,
                Ok(Ok(event)) => self.handle_event(&client, event).await,
                Ok(Err(e)) => {
                    error!(error = %e, "broker connection error");
                    return;
                }
            }
        }
    }

    async fn handle_event(&self, client: &AsyncClient, event: Event) {
        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                info!(host = %self.config.host, port = self.config.port, "connected to broker");
                self.subscribe_all(client).await;
                self.publish_init_requests(client).await;
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                self.idle.record();
                self.route(Envelope::new(publish.topic, publish.payload))
                    .await;
            }
            _ => {}
        }
    }

    async fn subscribe_all(&self, client: &AsyncClient) {
        for (pattern, qos) in subscription_table() {
            if let Err(e) = client.subscribe(pattern, qos_from(qos)).await {
                error!(pattern = pattern, error = %e, "subscribe failed");
            } else {
                debug!(pattern = pattern, qos = qos, "subscribed");
            }
        }
    }

    /// Replay the configured init requests. Runs on every (re)connection so
    /// peers that answer on subscribed topics re-prime the state we lost.
    async fn publish_init_requests(&self, client: &AsyncClient) {
        for request in &self.config.init_requests {
            let payload = request.payload.to_string();
            match client
                .publish(request.topic.clone(), QoS::AtLeastOnce, false, payload)
                .await
            {
                Ok(()) => info!(topic = %request.topic, "published init request"),
                Err(e) => error!(topic = %request.topic, error = %e, "init request publish failed"),
            }
        }
    }

    /// Deliver an envelope to every registration whose pattern matches.
    /// Blocks on full queues; backpressure propagates to the broker session.
    async fn route(&self, envelope: Envelope) {
        let targets = route_targets(&self.routes, &envelope.topic);
        if targets.is_empty() {
            debug!(topic = %envelope.topic, "no registration for topic, dropping");
            return;
        }

        for sender in targets {
            if sender.send(envelope.clone()).await.is_err() {
                error!(topic = %envelope.topic, "registration queue closed, dropping envelope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(patterns: &[&str]) -> (TopicRoute, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(8);
        (
            TopicRoute {
                patterns: patterns.iter().map(|s| s.to_string()).collect(),
                sender,
            },
            receiver,
        )
    }

    #[test]
    fn topics_route_to_matching_registrations() {
        let (common, _r1) = route(&["vms/#", "ais/#", "iis/#"]);
        let (acs_cms, _r2) = route(&["acs/#", "cms/#"]);
        let routes = vec![common, acs_cms];

        assert_eq!(route_targets(&routes, "vms/device/add").len(), 1);
        assert_eq!(route_targets(&routes, "acs/alarm/trigger").len(), 1);
        assert_eq!(route_targets(&routes, "smp/unrelated").len(), 0);
    }

    #[test]
    fn overlapping_patterns_fan_out() {
        let (a, _r1) = route(&["zvams/#"]);
        let (b, _r2) = route(&["zvams/face/capture/#"]);
        let routes = vec![a, b];

        assert_eq!(route_targets(&routes, "zvams/face/capture/gate3").len(), 2);
        assert_eq!(route_targets(&routes, "zvams/alarm/trigger").len(), 1);
    }

    #[test]
    fn idle_timer_expires_without_activity() {
        let timer = IdleTimer::new(Duration::from_millis(0));
        assert!(timer.expired());
    }

    #[test]
    fn idle_timer_resets_on_record() {
        let timer = IdleTimer::new(Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        timer.record();
        assert!(!timer.expired());
        assert!(timer.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn qos_levels_map_onto_transport_enum() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn routed_envelope_arrives_on_queue() {
        let (common, mut receiver) = route(&["vms/#"]);
        let manager = MqttConnectionManager::new(MqttConfig::default(), vec![common]);

        manager
            .route(Envelope::new("vms/device/add", &b"{}"[..]))
            .await;

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.topic, "vms/device/add");
    }
}
