//! Initialization request builders.
//!
//! After every (re)connection the receiver asks each peer platform to replay
//! its device table, since anything published while we were away is gone.
//! The request envelope mirrors the platform convention: a `head` with
//! service code, sender/receiver platform and a dashless session id, and a
//! `device_request` body.

use chrono::Local;
use serde_json::json;
use uuid::Uuid;

use sw_common::InitRequest;

const SENDER_PLATFORM: &str = "SMP";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Full-table device request for one peer platform (`ACS`, `VMS`, ...).
pub fn device_request(platform: &str) -> InitRequest {
    let platform = platform.to_uppercase();
    let payload = json!({
        "msg": {
            "head": {
                "service_code": format!("SMP_{platform}_DEVICE_REQUEST"),
                "version": 1.8,
                "sender_platform": SENDER_PLATFORM,
                "sender_sys": SENDER_PLATFORM,
                "receiver_platform": platform,
                "receiver_sys": platform,
                "session_id": Uuid::new_v4().simple().to_string(),
                "time_stamp": Local::now().format(TIMESTAMP_FORMAT).to_string(),
            },
            "body": {
                "device_request": { "request_type": 1 }
            }
        }
    });

    InitRequest {
        topic: format!("{}/device/request", platform.to_lowercase()),
        payload,
    }
}

/// Device requests for every listed platform.
pub fn device_requests(platforms: &[String]) -> Vec<InitRequest> {
    platforms.iter().map(|p| device_request(p)).collect()
}
