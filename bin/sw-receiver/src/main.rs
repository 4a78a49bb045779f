//! Skywatch Message Receiver
//!
//! Consumes subsystem events from the airport MQ and the flight-data ESB,
//! routes them through registered handlers, and pushes realtime updates to
//! websocket consumers. All long-running work (broker session, dispatch
//! workers, the ESB bridge) runs in supervised slots that are respawned
//! unconditionally when they die.

mod config;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sw_dispatch::worker::DedupGuard;
use sw_dispatch::{
    CallbackTable, Dispatcher, JsonTopicShape, Registration, WorkerKind, WorkerSupervisor,
};
use sw_esb::{
    initial_requests, EsbConsumer, EsbInboundWorker, EsbProducer, EsbPublisher, LapinEsbClient,
    OutboundQueue, PublishGate, XmlSubtypeShape,
};
use sw_fanout::WebSocketFanout;
use sw_mqtt::{MqttConnectionManager, TopicRoute};
use sw_store::{DedupLock, MetricsStore, RedisDedupLock, RedisMetricsStore};

use crate::handlers::SharedFanout;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("starting skywatch message receiver");
    let config = config::load_config();

    // Shared store: dedup lock and message counters
    let redis = sw_store::connect(&config.store.redis_url).await?;
    let dedup: Arc<dyn DedupLock> = Arc::new(RedisDedupLock::new(redis.clone()));
    let metrics: Arc<dyn MetricsStore> = Arc::new(RedisMetricsStore::new(
        redis,
        config.store.metrics_expire_secs,
    ));
    let dedup_ttl = Duration::from_secs(config.store.dedup_ttl_secs);

    // Outbound ESB queue, shared by the forwarding handlers and the publisher
    let (outbound_tx, outbound_rx) = mpsc::channel(config.esb.outbound_queue_capacity);
    let outbound_queue: OutboundQueue = Arc::new(Mutex::new(outbound_rx));

    // Each dispatch worker gets its own registry over its own websocket
    // pool, so one slot's fanout never contends with another's.
    let new_registry = {
        let fanout_config = config.fanout.clone();
        let outbound_tx = outbound_tx.clone();
        move || {
            let pool: SharedFanout = Arc::new(Mutex::new(WebSocketFanout::new(&fanout_config)));
            Arc::new(handlers::build_registry(pool, outbound_tx.clone()))
        }
    };

    // Static callback table: topic registrations plus the two ESB workers
    let table = CallbackTable::build(
        vec![
            Registration::new(
                "common",
                vec!["zvams/#", "vms/#", "ais/#", "xfhz/#", "ybbj/#", "ps/#", "iis/#"],
                WorkerKind::TopicDeduped,
                2,
            ),
            Registration::new(
                "acs-cms",
                vec!["acs/#", "cms/#"],
                WorkerKind::TopicDeduped,
                2,
            ),
            Registration::new("esb-inbound", vec![], WorkerKind::EsbInbound, 1),
            Registration::new("esb-publisher", vec![], WorkerKind::EsbPublisher, 1),
        ],
        config.dispatch.queue_capacity,
    );

    let routes = table
        .routes()
        .into_iter()
        .map(|(patterns, sender)| TopicRoute { patterns, sender })
        .collect();
    let mqtt = Arc::new(MqttConnectionManager::new(config.mqtt.clone(), routes));

    let esb_client = Arc::new(LapinEsbClient::connect(&config.esb).await?);

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut supervisor = WorkerSupervisor::new(
        Duration::from_secs(config.supervisor.poll_interval_secs),
        shutdown_tx.clone(),
    );

    // Broker session runs as a supervised slot like any worker
    {
        let mqtt = mqtt.clone();
        supervisor.add_workers(
            "mqtt-connection",
            1,
            Arc::new(move || {
                let mqtt = mqtt.clone();
                tokio::spawn(async move { mqtt.run().await })
            }),
        );
    }

    for entry in table.entries() {
        let code = entry.registration.code.clone();
        match entry.registration.kind {
            WorkerKind::Topic | WorkerKind::TopicDeduped => {
                for slot in 0..entry.registration.worker_count {
                    let guard = matches!(entry.registration.kind, WorkerKind::TopicDeduped).then(
                        || DedupGuard {
                            lock: dedup.clone(),
                            ttl: dedup_ttl,
                        },
                    );
                    let slot_name = if entry.registration.worker_count > 1 {
                        format!("{code}-{slot}")
                    } else {
                        code.clone()
                    };
                    let dispatcher = Arc::new(Dispatcher::new(
                        slot_name.clone(),
                        Arc::new(JsonTopicShape),
                        new_registry(),
                        metrics.clone(),
                        guard,
                        config.dispatch.handler_concurrency,
                    ));
                    let queue = entry.queue.clone();
                    supervisor.add_workers(
                        &slot_name,
                        1,
                        Arc::new(move || {
                            let dispatcher = dispatcher.clone();
                            let queue = queue.clone();
                            tokio::spawn(async move { dispatcher.run(queue).await })
                        }),
                    );
                }
            }
            WorkerKind::EsbInbound => {
                let dispatcher = Arc::new(Dispatcher::new(
                    code.clone(),
                    Arc::new(XmlSubtypeShape),
                    new_registry(),
                    metrics.clone(),
                    None,
                    config.dispatch.handler_concurrency,
                ));
                let consumer: Arc<dyn EsbConsumer> = esb_client.clone();
                supervisor.add_workers(
                    &code,
                    1,
                    Arc::new(move || {
                        let worker = EsbInboundWorker::new(consumer.clone(), dispatcher.clone());
                        tokio::spawn(async move { worker.run().await })
                    }),
                );
            }
            WorkerKind::EsbPublisher => {
                let producer: Arc<dyn EsbProducer> = esb_client.clone();
                // Shared across respawns: the peer requires a monotonic
                // sequence for the lifetime of the process.
                let sequence = EsbPublisher::new_sequence();
                let esb_config = config.esb.clone();
                let metrics = metrics.clone();
                let queue = outbound_queue.clone();
                supervisor.add_workers(
                    &code,
                    1,
                    Arc::new(move || {
                        let publisher = EsbPublisher::new(
                            producer.clone(),
                            esb_config.sender_id.clone(),
                            esb_config.origin_airport.clone(),
                            PublishGate::new(
                                Duration::from_millis(esb_config.min_publish_interval_ms),
                                esb_config.frequency_exempt_subtypes.clone(),
                            ),
                            sequence.clone(),
                            metrics.clone(),
                        );
                        let queue = queue.clone();
                        tokio::spawn(async move { publisher.run(queue).await })
                    }),
                );
            }
        }
    }

    // Prime the flight system with the configured data-load requests
    for request in initial_requests(&config.esb) {
        if outbound_tx.send(request).await.is_err() {
            warn!("outbound queue closed before initial requests were queued");
        }
    }

    let monitor = tokio::spawn(supervisor.monitor());

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    let _ = shutdown_tx.send(());
    let _ = monitor.await;

    info!("skywatch message receiver stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
