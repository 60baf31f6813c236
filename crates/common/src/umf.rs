//! UMF envelope codec.
//!
//! Every message exchanged with clients and services is a UMF envelope: a
//! JSON object with routable `to`/`from` fields. The wire uses the short
//! field names (`frm`, `bdy`, `typ`, `ver`, `ts`, `sig`); the long names are
//! accepted on ingress for callers that emit them.

use std::collections::HashMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{CodecError, Result};

/// UMF protocol version stamped into every created envelope.
pub const UMF_VERSION: &str = "UMF/1.4.6";

type HmacSha256 = Hmac<Sha256>;

/// Generate a short opaque id (client ids, tracers).
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// A UMF envelope.
///
/// `to`, `from` and `body` are required for a message to be routable; the
/// rest is optional. Emits short keys, accepts either form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmfMessage {
    #[serde(default)]
    pub mid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmid: Option<String>,

    #[serde(default)]
    pub to: String,

    #[serde(rename = "frm", alias = "from", default)]
    pub from: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<String>,

    #[serde(rename = "typ", alias = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    #[serde(rename = "ver", alias = "version", default)]
    pub version: String,

    #[serde(rename = "ts", alias = "timestamp", default)]
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,

    #[serde(rename = "bdy", alias = "body", default)]
    pub body: Value,

    #[serde(rename = "sig", alias = "signature", default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Default for UmfMessage {
    fn default() -> Self {
        Self {
            mid: Uuid::new_v4().to_string(),
            rmid: None,
            to: String::new(),
            from: String::new(),
            via: None,
            forward: None,
            typ: None,
            version: UMF_VERSION.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            headers: None,
            authorization: None,
            body: Value::Object(serde_json::Map::new()),
            signature: None,
        }
    }
}

impl UmfMessage {
    /// Create a routable envelope with a fresh `mid` and timestamp.
    pub fn new(to: impl Into<String>, from: impl Into<String>, body: Value) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            body,
            ..Self::default()
        }
    }

    /// Create a typed reply correlated to `original` via `rmid`.
    pub fn reply_to(original: &Self, from: impl Into<String>, typ: &str, body: Value) -> Self {
        Self {
            to: original.from.clone(),
            from: from.into(),
            rmid: Some(original.mid.clone()),
            typ: Some(typ.to_string()),
            body,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, typ: &str) -> Self {
        self.typ = Some(typ.to_string());
        self
    }

    pub fn with_forward(mut self, forward: impl Into<String>) -> Self {
        self.forward = Some(forward.into());
        self
    }

    /// A message is routable when `to`, `from` and `body` are all present.
    pub fn is_valid(&self) -> bool {
        !self.to.is_empty() && !self.from.is_empty() && !self.body.is_null()
    }

    /// Parse from wire JSON, accepting long or short field names.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize to the short wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parsed form of the `to` route.
    pub fn route(&self) -> Result<UmfRoute> {
        UmfRoute::parse(&self.to)
    }

    /// Sign the envelope: HMAC-SHA-256 over the short-form serialization with
    /// the signature field absent, lowercase hex into `sig`.
    pub fn sign(&mut self, secret: &str) -> Result<()> {
        self.signature = None;
        let canonical = serde_json::to_string(self)?;
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| CodecError::InvalidKey)?;
        mac.update(canonical.as_bytes());
        self.signature = Some(hex::encode(mac.finalize().into_bytes()));
        Ok(())
    }

    /// Recompute the signature and compare against the carried one.
    pub fn verify_signature(&self, secret: &str) -> bool {
        let Some(carried) = &self.signature else {
            return false;
        };
        let Ok(expected) = hex::decode(carried) else {
            return false;
        };
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let Ok(canonical) = serde_json::to_string(&unsigned) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(canonical.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

/// Parsed route: `[<instance>@]<service>[:[<method>]<apiRoute>]`.
///
/// When the instance segment carries a `-`, the part after it is the sub id
/// (used to smuggle a client id through reply routing).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UmfRoute {
    pub instance: String,
    pub sub_id: Option<String>,
    pub service: String,
    pub http_method: Option<String>,
    pub api_route: String,
}

impl UmfRoute {
    pub fn parse(route: &str) -> Result<Self> {
        let (instance_part, rest) = match route.split_once('@') {
            Some((i, r)) => (i, r),
            None => ("", route),
        };

        let (mut instance, mut sub_id) = (instance_part.to_string(), None);
        if let Some((inst, sub)) = instance_part.split_once('-') {
            instance = inst.to_string();
            sub_id = Some(sub.to_string());
        }

        let (service, tail) = match rest.split_once(':') {
            Some((s, t)) => (s, t),
            None => (rest, ""),
        };
        if service.is_empty() {
            return Err(CodecError::InvalidRoute(route.to_string()));
        }

        let (http_method, api_route) = if let Some(stripped) = tail.strip_prefix('[') {
            match stripped.split_once(']') {
                Some((verb, path)) => (Some(verb.to_lowercase()), path.to_string()),
                None => return Err(CodecError::InvalidRoute(route.to_string())),
            }
        } else {
            (None, tail.to_string())
        };

        Ok(Self {
            instance,
            sub_id,
            service: service.to_string(),
            http_method,
            api_route,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn created_message_is_valid() {
        let msg = UmfMessage::new("red:/", "client:/", json!({}));
        assert!(msg.is_valid());
        assert!(!msg.mid.is_empty());
        assert_eq!(msg.version, UMF_VERSION);
        assert!(!msg.timestamp.is_empty());
    }

    #[test]
    fn missing_required_fields_invalid() {
        let mut msg = UmfMessage::new("red:/", "client:/", json!({}));
        msg.to.clear();
        assert!(!msg.is_valid());

        let mut msg = UmfMessage::new("red:/", "client:/", json!({}));
        msg.from.clear();
        assert!(!msg.is_valid());

        let mut msg = UmfMessage::new("red:/", "client:/", json!({}));
        msg.body = Value::Null;
        assert!(!msg.is_valid());
    }

    #[test]
    fn emits_short_form() {
        let mut msg = UmfMessage::new("red:/", "client:/", json!({"x": 1}));
        msg.typ = Some("ping".to_string());
        msg.signature = Some("ab".to_string());
        let raw = msg.to_json().unwrap();
        for short in ["\"frm\"", "\"bdy\"", "\"typ\"", "\"ver\"", "\"ts\"", "\"sig\""] {
            assert!(raw.contains(short), "missing {short} in {raw}");
        }
        for long in ["\"from\"", "\"body\"", "\"type\"", "\"version\"", "\"timestamp\"", "\"signature\""] {
            assert!(!raw.contains(long), "unexpected {long} in {raw}");
        }
    }

    #[test]
    fn accepts_long_form_aliases() {
        let raw = json!({
            "mid": "m1",
            "to": "red:/",
            "from": "client:/",
            "type": "ping",
            "version": "UMF/1.4.6",
            "timestamp": "2026-01-01T00:00:00.000Z",
            "body": {"x": 1},
            "signature": "abcd"
        })
        .to_string();
        let msg = UmfMessage::from_json(&raw).unwrap();
        assert_eq!(msg.from, "client:/");
        assert_eq!(msg.typ.as_deref(), Some("ping"));
        assert_eq!(msg.version, "UMF/1.4.6");
        assert_eq!(msg.timestamp, "2026-01-01T00:00:00.000Z");
        assert_eq!(msg.body, json!({"x": 1}));
        assert_eq!(msg.signature.as_deref(), Some("abcd"));
    }

    #[test]
    fn accepts_short_form() {
        let raw = json!({
            "mid": "m1",
            "to": "red:/",
            "frm": "client:/",
            "typ": "ping",
            "ver": "UMF/1.4.6",
            "ts": "2026-01-01T00:00:00.000Z",
            "bdy": {"x": 1},
            "sig": "abcd"
        })
        .to_string();
        let msg = UmfMessage::from_json(&raw).unwrap();
        assert_eq!(msg.from, "client:/");
        assert_eq!(msg.typ.as_deref(), Some("ping"));
        assert_eq!(msg.body, json!({"x": 1}));
        assert_eq!(msg.signature.as_deref(), Some("abcd"));
    }

    #[test]
    fn reply_correlates_rmid() {
        let orig = UmfMessage::new("hydra-router:/", "abc@client:/", json!({}));
        let reply = UmfMessage::reply_to(&orig, "hydra-router:/", "pong", json!({}));
        assert_eq!(reply.rmid.as_deref(), Some(orig.mid.as_str()));
        assert_eq!(reply.to, "abc@client:/");
        assert_eq!(reply.typ.as_deref(), Some("pong"));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let mut msg = UmfMessage::new("red:/", "client:/", json!({"n": 42}));
        msg.sign("secret").unwrap();
        assert!(msg.signature.is_some());
        assert!(msg.verify_signature("secret"));
        assert!(!msg.verify_signature("other"));

        msg.body = json!({"n": 43});
        assert!(!msg.verify_signature("secret"));
    }

    #[test]
    fn signature_is_lowercase_hex() {
        let mut msg = UmfMessage::new("red:/", "client:/", json!({}));
        msg.sign("secret").unwrap();
        let sig = msg.signature.unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn route_full_form() {
        let r = UmfRoute::parse("inst1@red:[get]/v1/red/hello").unwrap();
        assert_eq!(r.instance, "inst1");
        assert_eq!(r.sub_id, None);
        assert_eq!(r.service, "red");
        assert_eq!(r.http_method.as_deref(), Some("get"));
        assert_eq!(r.api_route, "/v1/red/hello");
    }

    #[test]
    fn route_minimal_forms() {
        let r = UmfRoute::parse("red").unwrap();
        assert_eq!(r.service, "red");
        assert_eq!(r.api_route, "");
        assert!(r.instance.is_empty());

        let r = UmfRoute::parse("red:/v1/red/hello").unwrap();
        assert_eq!(r.service, "red");
        assert_eq!(r.http_method, None);
        assert_eq!(r.api_route, "/v1/red/hello");
    }

    #[test]
    fn route_sub_id() {
        let r = UmfRoute::parse("gw1-abc123@hydra-router:/").unwrap();
        assert_eq!(r.instance, "gw1");
        assert_eq!(r.sub_id.as_deref(), Some("abc123"));
        assert_eq!(r.service, "hydra-router");
        assert_eq!(r.api_route, "/");
    }

    #[test]
    fn route_method_is_lowercased() {
        let r = UmfRoute::parse("red:[GET]/x").unwrap();
        assert_eq!(r.http_method.as_deref(), Some("get"));
    }

    #[test]
    fn route_rejects_malformed() {
        assert!(UmfRoute::parse(":[get]/x").is_err());
        assert!(UmfRoute::parse("red:[get/x").is_err());
    }

    #[test]
    fn short_ids_are_short_and_unique() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
