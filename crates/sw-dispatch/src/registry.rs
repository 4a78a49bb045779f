//! Handler and callback registries.
//!
//! Handler lookup is an explicit, statically built map from handler name to
//! implementation, with alias entries and a no-op default for names nothing
//! has claimed. Callback registrations bind subscription topic patterns to a
//! worker kind, its envelope queue and a desired worker count; the table is
//! built once at startup and never mutated.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use sw_common::topics::PERSON_SNAP_TOPIC_PREFIX;
use sw_common::{Envelope, ParsedMessage, Result};

use crate::worker::EnvelopeQueue;

/// A business handler invoked with the parsed message tree. Implementations
/// live outside the dispatch core (persistence collaborators, forwarders);
/// the dispatcher only resolves and invokes them.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ParsedMessage) -> Result<()>;
}

/// Wire subtypes that all resolve to the generic flight-update handler:
/// route change, flight-number change, landing, takeoff, boarding start/end,
/// delay, cancel, return, pushback-return, diversion, gate/belt/stand update,
/// plan/estimate/actual time updates, terminal change, attribute change.
pub const FLIGHT_UPDATE_ALIASES: &[&str] = &[
    "iis_airl", "iis_hbtt", "iis_arre", "iis_depe", "iis_bore", "iis_poke", "iis_dlye",
    "iis_cane", "iis_rtne", "iis_bake", "iis_alte", "iis_gtls", "iis_blls", "iis_stls",
    "iis_fptt", "iis_fett", "iis_frtt", "iis_trml", "iis_fatt",
];

/// Derive the handler name for an MQ topic.
///
/// Pure and deterministic: lowercase, `/` → `_`. Person-snapshot topics
/// collapse onto the canonical snapshot prefix first, so every capture
/// sub-topic shares one handler.
pub fn derive_topic_handler_name(topic: &str) -> String {
    let effective = if topic.starts_with(PERSON_SNAP_TOPIC_PREFIX) {
        PERSON_SNAP_TOPIC_PREFIX
    } else {
        topic
    };

    effective.to_lowercase().replace('/', "_")
}

/// Derive the handler name for a payload-addressed (ESB) message subtype.
pub fn derive_subtype_handler_name(subtype: &str) -> String {
    format!("iis_{}", subtype.to_lowercase())
}

/// Static map from handler name to implementation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register `alias` to resolve to the handler registered under `target`.
    /// A missing target is a configuration error; the alias is skipped.
    pub fn alias(&mut self, alias: &str, target: &str) {
        match self.handlers.get(target) {
            Some(handler) => {
                self.handlers.insert(alias.to_string(), handler.clone());
            }
            None => warn!(alias = alias, target = target, "alias target not registered, skipping"),
        }
    }

    /// Apply the flight-update alias table onto the given target handler.
    pub fn register_flight_aliases(&mut self, target: &str) {
        for alias in FLIGHT_UPDATE_ALIASES {
            self.alias(alias, target);
        }
    }

    /// Resolve a handler by name. `None` means the message is not handled:
    /// the dispatcher treats it as a no-op and skips metrics.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What drives a registration's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Topic-routed MQ worker.
    Topic,
    /// Topic-routed MQ worker with distributed dedup before each handler.
    TopicDeduped,
    /// Single worker driven by the blocking foreign-bus consumer, not
    /// queue/topic-routed.
    EsbInbound,
    /// Single worker draining the outbound ESB queue.
    EsbPublisher,
}

/// Static registration: topic patterns, worker kind, desired worker count.
#[derive(Debug, Clone)]
pub struct Registration {
    pub code: String,
    pub topic_patterns: Vec<String>,
    pub kind: WorkerKind,
    pub worker_count: usize,
}

impl Registration {
    pub fn new(
        code: impl Into<String>,
        topic_patterns: Vec<&str>,
        kind: WorkerKind,
        worker_count: usize,
    ) -> Self {
        Self {
            code: code.into(),
            topic_patterns: topic_patterns.into_iter().map(String::from).collect(),
            kind,
            worker_count,
        }
    }
}

/// A registration bound to its envelope queue. The sender side goes to the
/// connection manager for routing; the shared receiver is drained by the
/// registration's workers.
pub struct BoundRegistration {
    pub registration: Registration,
    pub sender: mpsc::Sender<Envelope>,
    pub queue: EnvelopeQueue,
}

/// The callback table: all registrations, bound to queues once at startup.
pub struct CallbackTable {
    entries: Vec<BoundRegistration>,
}

impl CallbackTable {
    pub fn build(registrations: Vec<Registration>, queue_capacity: usize) -> Self {
        let entries = registrations
            .into_iter()
            .map(|registration| {
                let (sender, receiver) = mpsc::channel(queue_capacity);
                BoundRegistration {
                    registration,
                    sender,
                    queue: Arc::new(Mutex::new(receiver)),
                }
            })
            .collect();

        Self { entries }
    }

    pub fn entries(&self) -> &[BoundRegistration] {
        &self.entries
    }

    /// Routing view: (patterns, sender) for every topic-routed registration.
    pub fn routes(&self) -> Vec<(Vec<String>, mpsc::Sender<Envelope>)> {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.registration.kind,
                    WorkerKind::Topic | WorkerKind::TopicDeduped
                )
            })
            .map(|e| (e.registration.topic_patterns.clone(), e.sender.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: ParsedMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn topic_handler_name_is_lowercased_and_joined() {
        assert_eq!(derive_topic_handler_name("vms/device/add"), "vms_device_add");
        assert_eq!(derive_topic_handler_name("ACS/Alarm/Trigger"), "acs_alarm_trigger");
    }

    #[test]
    fn topic_handler_name_is_deterministic() {
        for topic in ["zvams/analysis/people/density", "cms/car/transit", "ps/lot/state"] {
            assert_eq!(derive_topic_handler_name(topic), derive_topic_handler_name(topic));
        }
    }

    #[test]
    fn person_snapshot_topics_collapse_to_canonical_name() {
        assert_eq!(
            derive_topic_handler_name("zvams/face/capture/gate3/cam12"),
            "zvams_face_capture"
        );
        assert_eq!(derive_topic_handler_name("zvams/face/capture"), "zvams_face_capture");
        // Non-snapshot analytics topics are untouched
        assert_eq!(
            derive_topic_handler_name("zvams/alarm/trigger"),
            "zvams_alarm_trigger"
        );
    }

    #[test]
    fn subtype_handler_name_is_prefixed_and_lowercased() {
        assert_eq!(derive_subtype_handler_name("ARRE"), "iis_arre");
        assert_eq!(derive_subtype_handler_name("dfie"), "iis_dfie");
    }

    #[test]
    fn alias_table_resolves_to_update_handler() {
        let mut registry = HandlerRegistry::new();
        let update = CountingHandler::new();
        registry.register("iis_update", update.clone());
        registry.register_flight_aliases("iis_update");

        // Landing resolves through the alias to the same handler instance
        let resolved = registry.resolve("iis_arre").unwrap();
        let update_dyn: Arc<dyn MessageHandler> = update;
        assert!(Arc::ptr_eq(&resolved, &update_dyn));

        for alias in FLIGHT_UPDATE_ALIASES {
            assert!(registry.resolve(alias).is_some(), "missing alias {alias}");
        }
    }

    #[test]
    fn unregistered_name_resolves_to_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("vms_device_add").is_none());
    }

    #[test]
    fn alias_with_missing_target_is_skipped() {
        let mut registry = HandlerRegistry::new();
        registry.alias("iis_arre", "iis_update");
        assert!(registry.resolve("iis_arre").is_none());
    }

    #[test]
    fn routes_exclude_esb_registrations() {
        let table = CallbackTable::build(
            vec![
                Registration::new("common", vec!["vms/#", "ais/#"], WorkerKind::TopicDeduped, 2),
                Registration::new("esb-in", vec![], WorkerKind::EsbInbound, 1),
            ],
            16,
        );

        let routes = table.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0, vec!["vms/#".to_string(), "ais/#".to_string()]);
    }
}
