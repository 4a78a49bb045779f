//! Skywatch message dispatch
//!
//! This crate provides the routing and worker-supervision core:
//! - HandlerRegistry: explicit handler-name map with aliases and a no-op default
//! - CallbackTable: static topic-pattern → worker registrations
//! - Dispatcher: per-worker fetch/parse/resolve/invoke loop with error containment
//! - WorkerSupervisor: spawns the configured worker count and respawns the dead

pub mod registry;
pub mod supervisor;
pub mod worker;

pub use registry::{
    derive_topic_handler_name, BoundRegistration, CallbackTable, HandlerRegistry, MessageHandler,
    Registration, WorkerKind, FLIGHT_UPDATE_ALIASES,
};
pub use supervisor::{SlotState, WorkerFactory, WorkerSupervisor};
pub use worker::{DedupGuard, Dispatcher, EnvelopeQueue, JsonTopicShape, MessageShape};
