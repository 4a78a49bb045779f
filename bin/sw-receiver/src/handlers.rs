//! Business handlers and the registry wiring.
//!
//! Handlers validate the relevant payload section and push realtime updates
//! to the websocket fanout. Record persistence happens in the platform
//! backend, not here. Video-analytics handlers are additionally wrapped in
//! the ESB forwarding decorator so the flight system receives them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use sw_common::{nested_value, DispatchError, ParsedMessage, Result};
use sw_dispatch::{HandlerRegistry, MessageHandler};
use sw_esb::{EsbOutboundMessage, ForwardToEsb};
use sw_fanout::WebSocketFanout;

pub type SharedFanout = Arc<Mutex<WebSocketFanout>>;

/// Subsystems with the standard device-maintenance topic set.
const DEVICE_SUBSYSTEMS: &[&str] = &["ais", "acs", "xfhz", "ybbj", "cms", "vms"];

/// Subsystems publishing alarm trigger/deactivation events.
const ALARM_SUBSYSTEMS: &[&str] = &["ais", "acs", "xfhz", "ybbj", "cms", "vms", "zvams"];

/// Video-analytics handler names with their outbound bus type/subtype.
const ANALYSIS_FORWARDS: &[(&str, &str, &str)] = &[
    ("zvams_analysis_people_density", "SIP", "REALTIMEDENSITY"),
    ("zvams_analysis_density_alarm", "SIP", "ALARMDENSITY"),
    ("zvams_analysis_queue_alarm", "SIP", "ALARMQUEUE"),
    ("zvams_analysis_people_queue", "SIP", "REALTIMEQUEUE"),
    ("zvams_analysis_people_counting", "SIP", "REALTIMECHANNEL"),
    ("zvams_discern_behavior_areainvasion", "SIP", "ALARMINVASION"),
    ("zvams_discern_behavior_border", "SIP", "ALARMBORDER"),
    ("zvams_discern_behavior_wandering", "SIP", "ALARMWANDERING"),
    ("zvams_face_capture", "SIP", "CAPTURE"),
    ("zvams_placement_alarm", "DFME", "DPUE"),
];

/// Flight basic-resource families: handler name infix with the payload
/// section the bus delivers the records under.
const BASIC_RESOURCE_SECTIONS: &[(&str, &'static [&'static str])] = &[
    ("gt", &["MSG", "GATE"]),
    ("bl", &["MSG", "BELT"]),
    ("cc", &["MSG", "CNTR"]),
    ("st", &["MSG", "STND"]),
    ("ar", &["MSG", "ABRN"]),
    ("aw", &["MSG", "AWAY"]),
    ("ap", &["MSG", "APOT"]),
];

/// Basic-resource operations: insert, update, delete, full load.
const BASIC_RESOURCE_OPS: &[&str] = &["ie", "ue", "de", "dl"];

/// Generic section handler: extract a nested payload section, check its
/// key field, optionally push it to a websocket endpoint.
pub struct SectionHandler {
    path: &'static [&'static str],
    required_field: Option<&'static str>,
    fanout: Option<(SharedFanout, &'static str)>,
}

impl SectionHandler {
    pub fn new(
        path: &'static [&'static str],
        required_field: Option<&'static str>,
        fanout: Option<(SharedFanout, &'static str)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            required_field,
            fanout,
        })
    }
}

#[async_trait]
impl MessageHandler for SectionHandler {
    async fn handle(&self, message: ParsedMessage) -> Result<()> {
        let section = nested_value(&message, self.path)
            .ok_or_else(|| DispatchError::InvalidField(self.path.join(".")))?;

        if let Some(field) = self.required_field {
            if section.get(field).map(|v| v.is_null()).unwrap_or(true) {
                return Err(DispatchError::InvalidField(field.to_string()));
            }
        }

        if let Some((fanout, suffix)) = &self.fanout {
            fanout.lock().await.publish(suffix, section.clone()).await;
        }
        Ok(())
    }
}

/// Flight-system messages carry one record or a whole table of them under
/// the section. Flight dynamics and the basic resources all use this shape.
pub struct RecordSetHandler {
    path: &'static [&'static str],
    fanout: Option<(SharedFanout, &'static str)>,
}

impl RecordSetHandler {
    pub fn new(
        path: &'static [&'static str],
        fanout: Option<(SharedFanout, &'static str)>,
    ) -> Arc<Self> {
        Arc::new(Self { path, fanout })
    }
}

#[async_trait]
impl MessageHandler for RecordSetHandler {
    async fn handle(&self, message: ParsedMessage) -> Result<()> {
        let section = nested_value(&message, self.path)
            .ok_or_else(|| DispatchError::InvalidField(self.path.join(".")))?;

        let records: Vec<ParsedMessage> = match section {
            ParsedMessage::Array(items) => items.clone(),
            single => vec![single.clone()],
        };

        if let Some((fanout, suffix)) = &self.fanout {
            let mut fanout = fanout.lock().await;
            for record in records {
                fanout.publish(suffix, record).await;
            }
        }
        Ok(())
    }
}

/// Build the full handler registry. The fanout pool is supplied by the
/// caller; each dispatch worker gets its own registry over its own pool.
pub fn build_registry(
    fanout: SharedFanout,
    outbound: mpsc::Sender<EsbOutboundMessage>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    // Device maintenance: add/delete/update plus state changes and full sync
    for subsystem in DEVICE_SUBSYSTEMS {
        let device = SectionHandler::new(
            &["msg", "body", "device"],
            Some("device_code"),
            Some((fanout.clone(), "device")),
        );
        for op in ["add", "delete", "update"] {
            registry.register(format!("{subsystem}_device_{op}"), device.clone());
        }
        registry.register(
            format!("{subsystem}_device_statechange"),
            SectionHandler::new(
                &["msg", "body", "device_status"],
                Some("device_code"),
                Some((fanout.clone(), "device")),
            ),
        );
        registry.register(
            format!("{subsystem}_device_sync"),
            SectionHandler::new(&["msg", "body", "device_sync", "device_list"], None, None),
        );
    }

    // Alarm lifecycle events
    for subsystem in ALARM_SUBSYSTEMS {
        let alarm = SectionHandler::new(
            &["msg", "body", "event"],
            None,
            Some((fanout.clone(), "event")),
        );
        registry.register(format!("{subsystem}_alarm_trigger"), alarm.clone());
        registry.register(format!("{subsystem}_alarm_deactive"), alarm);
    }
    // Video-analytics alarms also go to the flight system
    if let Some(alarm) = registry.resolve("zvams_alarm_trigger") {
        registry.register(
            "zvams_alarm_trigger",
            Arc::new(ForwardToEsb::new(
                alarm,
                outbound.clone(),
                "SIP",
                "REALTIMEALARM",
            )),
        );
    }

    // Access control and crossing traffic
    let punch = SectionHandler::new(
        &["msg", "body", "entrance_punch"],
        None,
        Some((fanout.clone(), "current")),
    );
    registry.register("acs_accesscontrol_paybycard", punch.clone());
    registry.register("acs_accesscontrol_door", punch);
    registry.register(
        "cms_car_transit",
        SectionHandler::new(
            &["msg", "body", "car_transit"],
            None,
            Some((fanout.clone(), "current")),
        ),
    );

    // Staff pass records
    let person = SectionHandler::new(&["msg", "body"], None, None);
    for op in ["add", "delete", "update", "sync"] {
        registry.register(format!("acs_perinfomation_{op}"), person.clone());
    }

    // Video analytics, mirrored to the bus
    for (name, msg_type, subtype) in ANALYSIS_FORWARDS {
        let inner = SectionHandler::new(&["msg", "body"], None, None);
        registry.register(
            *name,
            Arc::new(ForwardToEsb::new(
                inner,
                outbound.clone(),
                *msg_type,
                *subtype,
            )),
        );
    }

    // Flight dynamics: insert, delete, full sync, and the update family
    let flight = RecordSetHandler::new(&["MSG", "DFLT"], Some((fanout, "flight")));
    for name in ["iis_update", "iis_dfie", "iis_dfde", "iis_dfdl"] {
        registry.register(name, flight.clone());
    }
    registry.register_flight_aliases("iis_update");

    // Basic resources (gates, belts, counters, stands, airlines, airways,
    // airports): same bulk shape, no realtime consumers
    for (infix, path) in BASIC_RESOURCE_SECTIONS {
        let resource = RecordSetHandler::new(*path, None);
        for op in BASIC_RESOURCE_OPS {
            registry.register(format!("iis_{infix}{op}"), resource.clone());
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sw_common::FanoutConfig;
    use sw_dispatch::FLIGHT_UPDATE_ALIASES;

    fn pool() -> SharedFanout {
        Arc::new(Mutex::new(WebSocketFanout::new(&FanoutConfig::default())))
    }

    fn registry() -> HandlerRegistry {
        let (outbound, _rx) = mpsc::channel(16);
        build_registry(pool(), outbound)
    }

    #[test]
    fn registry_covers_device_and_alarm_names() {
        let registry = registry();

        for subsystem in DEVICE_SUBSYSTEMS {
            for op in ["add", "delete", "update", "statechange", "sync"] {
                let name = format!("{subsystem}_device_{op}");
                assert!(registry.resolve(&name).is_some(), "missing {name}");
            }
        }
        for subsystem in ALARM_SUBSYSTEMS {
            assert!(registry.resolve(&format!("{subsystem}_alarm_trigger")).is_some());
        }
        for alias in FLIGHT_UPDATE_ALIASES {
            assert!(registry.resolve(alias).is_some(), "missing {alias}");
        }
    }

    #[test]
    fn registry_covers_basic_resource_names() {
        let registry = registry();

        for (infix, _) in BASIC_RESOURCE_SECTIONS {
            for op in BASIC_RESOURCE_OPS {
                let name = format!("iis_{infix}{op}");
                assert!(registry.resolve(&name).is_some(), "missing {name}");
            }
        }
    }

    #[tokio::test]
    async fn basic_resource_handler_accepts_single_and_bulk_records() {
        let registry = registry();
        let handler = registry.resolve("iis_gtie").unwrap();

        let single = json!({"MSG": {"GATE": {"GTCD": "A12"}}});
        assert!(handler.handle(single).await.is_ok());

        let bulk = json!({"MSG": {"GATE": [{"GTCD": "A12"}, {"GTCD": "A13"}]}});
        assert!(handler.handle(bulk).await.is_ok());

        let wrong_section = json!({"MSG": {"BELT": {"BLCD": "B3"}}});
        assert!(handler.handle(wrong_section).await.is_err());
    }

    #[tokio::test]
    async fn device_handler_requires_device_code() {
        let registry = registry();
        let handler = registry.resolve("vms_device_add").unwrap();

        let ok = json!({"msg": {"body": {"device": {"device_code": "CAM-1"}}}});
        assert!(handler.handle(ok).await.is_ok());

        let missing = json!({"msg": {"body": {"device": {"name": "cam"}}}});
        let err = handler.handle(missing).await.unwrap_err();
        assert!(err.is_business());
    }

    #[tokio::test]
    async fn analysis_handler_forwards_to_outbound_queue() {
        let (outbound, mut rx) = mpsc::channel(16);
        let registry = build_registry(pool(), outbound);
        let handler = registry.resolve("zvams_analysis_people_density").unwrap();

        handler
            .handle(json!({"msg": {"body": {"density": 3}}}))
            .await
            .unwrap();

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.msg_type, "SIP");
        assert_eq!(queued.subtype, "REALTIMEDENSITY");
    }

    #[tokio::test]
    async fn flight_handler_accepts_single_and_bulk_records() {
        let flight = RecordSetHandler::new(&["MSG", "DFLT"], None);

        let single = json!({"MSG": {"DFLT": {"FLNO": "CA1001"}}});
        assert!(flight.handle(single).await.is_ok());

        let bulk = json!({"MSG": {"DFLT": [{"FLNO": "CA1001"}, {"FLNO": "CA1002"}]}});
        assert!(flight.handle(bulk).await.is_ok());

        let missing = json!({"MSG": {"META": {}}});
        assert!(flight.handle(missing).await.is_err());
    }
}
