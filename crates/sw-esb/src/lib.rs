//! Skywatch ESB bridge
//!
//! Two-way bridge to the enterprise service bus carrying flight data:
//! - inbound: XML envelopes consumed from the bus and dispatched by subtype
//! - outbound: a single throttled, sequence-stamped publisher worker
//! - forward: handler decorator mirroring handled messages onto the bus

pub mod client;
pub mod envelope;
pub mod forward;
pub mod inbound;
pub mod publisher;

pub use client::{EsbConsumer, EsbProducer, LapinEsbClient};
pub use envelope::{
    basic_request_body, initial_requests, parse_xml, subtype, EsbMeta, EsbOutboundMessage,
    OutboundEnvelope,
};
pub use forward::ForwardToEsb;
pub use inbound::{EsbInboundWorker, XmlSubtypeShape};
pub use publisher::{EsbPublisher, OutboundQueue, PublishGate};
