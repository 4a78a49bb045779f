//! Environment-based configuration.
//!
//! Every knob has a default suitable for a local deployment; production
//! overrides come from `SKYWATCH_*` environment variables.

use sw_common::{
    DispatchConfig, EsbConfig, FanoutConfig, MqttConfig, ReceiverConfig, StoreConfig,
    SupervisorConfig,
};
use sw_mqtt::init::device_requests;

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    env_string(name, default)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn load_config() -> ReceiverConfig {
    let init_platforms = env_list(
        "SKYWATCH_INIT_REQUEST_PLATFORMS",
        "ACS,VMS,AIS,XFHZ,YBBJ,CMS",
    );

    ReceiverConfig {
        mqtt: MqttConfig {
            host: env_string("SKYWATCH_MQTT_HOST", "127.0.0.1"),
            port: env_parse("SKYWATCH_MQTT_PORT", 1883),
            username: env_string("SKYWATCH_MQTT_USERNAME", ""),
            password: env_string("SKYWATCH_MQTT_PASSWORD", ""),
            client_id: env_string("SKYWATCH_MQTT_CLIENT_ID", "sw-receiver"),
            keepalive_secs: env_parse("SKYWATCH_MQTT_KEEPALIVE_SECS", 65),
            idle_reconnect_secs: env_parse("SKYWATCH_MQTT_IDLE_RECONNECT_SECS", 120),
            init_requests: device_requests(&init_platforms),
        },
        store: StoreConfig {
            redis_url: env_string("SKYWATCH_REDIS_URL", "redis://127.0.0.1:6379"),
            dedup_ttl_secs: env_parse("SKYWATCH_DEDUP_TTL_SECS", 300),
            metrics_expire_secs: env_parse("SKYWATCH_METRICS_EXPIRE_SECS", 86_400),
        },
        esb: EsbConfig {
            uri: env_string("SKYWATCH_ESB_URI", "amqp://127.0.0.1:5672/%2f"),
            inbound_queue: env_string("SKYWATCH_ESB_INBOUND_QUEUE", "iis.inbound"),
            outbound_exchange: env_string("SKYWATCH_ESB_OUTBOUND_EXCHANGE", "iis.outbound"),
            outbound_routing_key: env_string("SKYWATCH_ESB_ROUTING_KEY", "smp.iis"),
            sender_id: env_string("SKYWATCH_ESB_SENDER_ID", "T3SIP"),
            origin_airport: env_string("SKYWATCH_ESB_ORIGIN_AIRPORT", "ZUGY"),
            min_publish_interval_ms: env_parse("SKYWATCH_ESB_MIN_PUBLISH_INTERVAL_MS", 1_000),
            frequency_exempt_subtypes: env_list("SKYWATCH_ESB_EXEMPT_SUBTYPES", ""),
            initial_request_codes: env_list(
                "SKYWATCH_ESB_INITIAL_REQUEST_CODES",
                "RQAP,RQAR,RQAW,RQGT,RQST,RQBL,RQCC,RQDF",
            ),
            outbound_queue_capacity: env_parse("SKYWATCH_ESB_QUEUE_CAPACITY", 1_000),
        },
        fanout: FanoutConfig {
            base_url: env_string("SKYWATCH_WS_BASE_URL", "ws://127.0.0.1:8000/ws"),
            max_age_secs: env_parse("SKYWATCH_WS_MAX_AGE_SECS", 3_600),
            safety_margin_secs: env_parse("SKYWATCH_WS_SAFETY_MARGIN_SECS", 30),
            connect_timeout_ms: env_parse("SKYWATCH_WS_CONNECT_TIMEOUT_MS", 5_000),
        },
        supervisor: SupervisorConfig {
            poll_interval_secs: env_parse("SKYWATCH_SUPERVISOR_POLL_SECS", 5),
        },
        dispatch: DispatchConfig {
            handler_concurrency: env_parse("SKYWATCH_HANDLER_CONCURRENCY", 4),
            queue_capacity: env_parse("SKYWATCH_QUEUE_CAPACITY", 1_000),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete_without_environment() {
        let config = load_config();

        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.store.dedup_ttl_secs, 300);
        assert_eq!(config.esb.sender_id, "T3SIP");
        assert_eq!(config.dispatch.handler_concurrency, 4);
        assert!(!config.mqtt.init_requests.is_empty());
        assert_eq!(config.esb.initial_request_codes.len(), 8);
    }

    #[test]
    fn list_parsing_trims_and_drops_empties() {
        assert_eq!(
            env_list("SKYWATCH_TEST_UNSET_LIST", "A, B,,C"),
            vec!["A", "B", "C"]
        );
        assert!(env_list("SKYWATCH_TEST_UNSET_EMPTY", "").is_empty());
    }
}
