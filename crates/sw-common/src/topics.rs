//! Subscription topic table and pattern matching.
//!
//! One wildcard subscription per subsystem. The access-control feed is taken
//! at QoS 0 because of its volume; everything else at QoS 1.

/// Video analytics
pub const ZVAMS_SUBSCRIBE_TOPIC: &str = "zvams/#";
/// Video surveillance
pub const VMS_SUBSCRIBE_TOPIC: &str = "vms/#";
/// Flight information
pub const IIS_SUBSCRIBE_TOPIC: &str = "iis/#";
/// Access control
pub const ACS_SUBSCRIBE_TOPIC: &str = "acs/#";
/// Passage-way / crossing
pub const CMS_SUBSCRIBE_TOPIC: &str = "cms/#";
/// Perimeter
pub const AIS_SUBSCRIBE_TOPIC: &str = "ais/#";
/// Fire
pub const XFHZ_SUBSCRIBE_TOPIC: &str = "xfhz/#";
/// Concealed alarm
pub const YBBJ_SUBSCRIBE_TOPIC: &str = "ybbj/#";
/// Parking
pub const PS_SUBSCRIBE_TOPIC: &str = "ps/#";

/// Person-snapshot topics all collapse onto this prefix's handler.
pub const PERSON_SNAP_TOPIC_PREFIX: &str = "zvams/face/capture";

pub const DEFAULT_QOS: u8 = 1;

/// The full subscription table as (pattern, qos) pairs.
pub fn subscription_table() -> Vec<(&'static str, u8)> {
    vec![
        (ZVAMS_SUBSCRIBE_TOPIC, DEFAULT_QOS),
        (VMS_SUBSCRIBE_TOPIC, DEFAULT_QOS),
        (IIS_SUBSCRIBE_TOPIC, DEFAULT_QOS),
        // High volume, delivery loss acceptable
        (ACS_SUBSCRIBE_TOPIC, 0),
        (CMS_SUBSCRIBE_TOPIC, DEFAULT_QOS),
        (XFHZ_SUBSCRIBE_TOPIC, DEFAULT_QOS),
        (YBBJ_SUBSCRIBE_TOPIC, DEFAULT_QOS),
        (AIS_SUBSCRIBE_TOPIC, DEFAULT_QOS),
        (PS_SUBSCRIBE_TOPIC, DEFAULT_QOS),
    ]
}

/// Match a topic against a subscription pattern.
///
/// Supports the trailing multi-level wildcard (`acs/#`) and exact matches.
/// A `#` pattern segment matches the parent level itself and everything
/// below it, per MQTT semantics.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/#") {
        return topic == prefix || topic.starts_with(&format!("{prefix}/"));
    }
    if pattern == "#" {
        return true;
    }
    pattern == topic
}
