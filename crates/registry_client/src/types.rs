//! Wire shapes shared with the registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One registered service instance, as stored in the registry's nodes hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub service_name: String,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub host_name: String,
    pub updated_on: DateTime<Utc>,
}

impl NodeEntry {
    /// Seconds since the instance last refreshed its entry.
    pub fn elapsed(&self) -> i64 {
        (Utc::now() - self.updated_on).num_seconds()
    }
}

/// A live instance of a service, derived from presence keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub service_name: String,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
}

/// Normalized reply from a registry API request.
///
/// Replies from services carry `{statusCode, headers?, payload?, result?}` in
/// the envelope body; `headers`/`payload` are present when the service chose
/// to speak raw transport, `result` when it used the normalized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(rename = "statusCode", default = "default_status")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

fn default_status() -> u16 {
    200
}

impl Default for ApiResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: None,
            payload: None,
            result: None,
        }
    }
}

impl ApiResponse {
    /// Failure shape: `{statusCode, result: {reason}}`.
    pub fn failure(status_code: u16, reason: &str) -> Self {
        Self {
            status_code,
            result: Some(json!({ "reason": reason })),
            ..Self::default()
        }
    }

    /// Parse from a reply envelope body; a body that does not carry the
    /// response shape becomes the `result` of a 200.
    pub fn from_body(body: &Value) -> Self {
        match serde_json::from_value::<ApiResponse>(body.clone()) {
            Ok(resp) if body.get("statusCode").is_some() => resp,
            _ => Self {
                result: Some(body.clone()),
                ..Self::default()
            },
        }
    }

    /// Serialize back to an envelope body.
    pub fn to_body(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "statusCode": 500 }))
    }
}
