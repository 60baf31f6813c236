//! Per-request forwarding pipeline: buffered body in, registry API call,
//! re-framed response out.

use std::collections::HashMap;
use std::io::{Read, Write};

use bytes::Bytes;
use common::{short_id, UmfMessage};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::issue_log::Severity;
use crate::route_table::RouteMatch;
use crate::{Gateway, Result};

/// Tracer header echoed on every forwarded response.
pub const TRACER_HEADER: &str = "x-hydra-tracer";

/// A response ready to be written to the client.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ForwardedResponse {
    /// Uniform JSON shape used when the upstream spoke the normalized form.
    fn uniform(status: u16, result: Value, extra_headers: Vec<(String, String)>) -> Self {
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        headers.extend(extra_headers);
        let body = json!({ "statusCode": status, "result": result });
        Self {
            status,
            headers,
            body: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        }
    }
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Decode a request body per its content type: JSON stays structured, form
/// bodies become a string map, anything else is raw text.
fn decode_body(content_type: Option<&str>, bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    let content_type = content_type.unwrap_or("");
    if content_type.contains("json") {
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
    } else if content_type.contains("application/x-www-form-urlencoded") {
        let mut map = serde_json::Map::new();
        for (key, value) in url::form_urlencoded::parse(bytes) {
            map.insert(key.into_owned(), Value::String(value.into_owned()));
        }
        Value::Object(map)
    } else {
        Value::String(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl Gateway {
    /// Build the outbound envelope for a matched request.
    fn build_envelope(
        &self,
        method: &str,
        headers: &HashMap<String, String>,
        body: Value,
        matched: &RouteMatch,
        tracer: &str,
    ) -> UmfMessage {
        let mut out_headers: HashMap<String, String> = headers
            .iter()
            .filter(|(name, _)| {
                name.as_str() != "accept-encoding" && name.as_str() != "content-encoding"
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        out_headers.insert(TRACER_HEADER.to_string(), tracer.to_string());

        let mut envelope = UmfMessage::new(
            format!(
                "{}:[{}]{}",
                matched.service,
                method.to_lowercase(),
                matched.forwarded_url
            ),
            self.self_from(),
            body,
        );
        envelope.mid = format!("{}-{}", Uuid::new_v4(), tracer);
        envelope.authorization = headers.get("authorization").cloned();
        envelope.headers = Some(out_headers);
        envelope
    }

    /// Forward a matched HTTP request and re-frame the response.
    ///
    /// `headers` carries lowercase header names. OPTIONS preflights never
    /// reach this point.
    pub async fn forward_http(
        &self,
        method: &str,
        headers: &HashMap<String, String>,
        body: Bytes,
        matched: &RouteMatch,
    ) -> ForwardedResponse {
        if matched.external {
            return self.forward_external(method, headers, body, matched).await;
        }

        let tracer = short_id();
        let mut cors = self.config.cors_headers();
        cors.push((TRACER_HEADER.to_string(), tracer.clone()));

        let body_bytes = if headers
            .get("content-encoding")
            .is_some_and(|enc| enc.contains("gzip"))
        {
            match gunzip(&body) {
                Ok(inflated) => Bytes::from(inflated),
                Err(e) => {
                    self.log_issue(
                        Severity::Error,
                        format!("failed to inflate request body: {e}"),
                    );
                    Bytes::new()
                }
            }
        } else {
            body
        };

        let decoded = decode_body(headers.get("content-type").map(|s| s.as_str()), &body_bytes);
        let envelope = self.build_envelope(method, headers, decoded, matched, &tracer);

        debug!(tracer = %tracer, to = %envelope.to, "forwarding request");
        counter!("gateway_http_forwards_total").increment(1);
        self.http_stats.log(&matched.service);

        let response = match self
            .registry
            .make_api_request(&envelope, self.config.request_timeout())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.log_issue(
                    Severity::Fatal,
                    format!("registry request for {} failed: {e}", matched.service),
                );
                self.error_stats.log(&matched.service);
                counter!("gateway_http_errors_total").increment(1);
                return ForwardedResponse::uniform(500, json!({ "reason": e.to_string() }), cors);
            }
        };

        if response.status_code > 201 {
            self.error_stats.log(&matched.service);
            counter!("gateway_http_errors_total").increment(1);
        }
        if (400..500).contains(&response.status_code) {
            self.log_issue(
                Severity::Error,
                format!(
                    "{} returned {} for {}",
                    matched.service, response.status_code, envelope.to
                ),
            );
        } else if response.status_code >= 500 {
            self.log_issue(
                Severity::Fatal,
                format!(
                    "{} returned {} for {}",
                    matched.service, response.status_code, envelope.to
                ),
            );
        }

        let accepts_gzip = headers
            .get("accept-encoding")
            .is_some_and(|enc| enc.contains("gzip"));

        match &response.headers {
            Some(upstream_headers) => {
                let mut out: Vec<(String, String)> = upstream_headers
                    .iter()
                    .map(|(name, value)| (name.to_lowercase(), value.clone()))
                    .collect();
                for (name, value) in cors {
                    if !out.iter().any(|(n, _)| *n == name) {
                        out.push((name, value));
                    }
                }

                let is_json = upstream_headers
                    .iter()
                    .any(|(name, value)| {
                        name.eq_ignore_ascii_case("content-type") && value.contains("json")
                    });
                let payload = response.payload.clone().unwrap_or_default();

                let body = if is_json {
                    // Re-serialize the upstream JSON so the raw payload field
                    // never leaks through, then honor the client's encoding.
                    let value: Value = serde_json::from_str(&payload)
                        .unwrap_or_else(|_| Value::String(payload.clone()));
                    let serialized = serde_json::to_vec(&value).unwrap_or_default();
                    if accepts_gzip {
                        match gzip(&serialized) {
                            Ok(compressed) => {
                                out.push((
                                    "content-encoding".to_string(),
                                    "gzip".to_string(),
                                ));
                                Bytes::from(compressed)
                            }
                            Err(e) => {
                                warn!("gzip of response failed: {}", e);
                                Bytes::from(serialized)
                            }
                        }
                    } else {
                        Bytes::from(serialized)
                    }
                } else {
                    Bytes::from(payload.into_bytes())
                };

                ForwardedResponse {
                    status: response.status_code,
                    headers: out,
                    body,
                }
            }
            None => ForwardedResponse::uniform(
                response.status_code,
                response.result.clone().unwrap_or(Value::Null),
                cors,
            ),
        }
    }

    /// Proxy a request matched by an external route over plain HTTP.
    async fn forward_external(
        &self,
        method: &str,
        headers: &HashMap<String, String>,
        body: Bytes,
        matched: &RouteMatch,
    ) -> ForwardedResponse {
        let url = format!(
            "{}{}",
            matched.service.trim_end_matches('/'),
            matched.forwarded_url
        );
        let method = match reqwest::Method::from_bytes(method.to_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => reqwest::Method::GET,
        };
        let mut request = self.http_client.request(method, &url).body(body.to_vec());
        for (name, value) in headers {
            if name != "host" && name != "content-length" {
                request = request.header(name, value);
            }
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let body = response.bytes().await.unwrap_or_default();
                ForwardedResponse {
                    status,
                    headers,
                    body,
                }
            }
            Err(e) => {
                self.log_issue(Severity::Fatal, format!("external proxy to {url} failed: {e}"));
                ForwardedResponse::uniform(
                    502,
                    json!({ "reason": e.to_string() }),
                    self.config.cors_headers(),
                )
            }
        }
    }

    /// Envelope-reply mode for bracketed-method frames arriving over a
    /// persistent connection: call the service API and frame the result back
    /// with `rmid` set to the originating `mid`.
    pub async fn forward_ws_api(&self, msg: &UmfMessage) -> Result<UmfMessage> {
        let mut envelope = msg.clone();
        envelope.mid = Uuid::new_v4().to_string();
        envelope.from = self.self_from();

        let response = self
            .registry
            .make_api_request(&envelope, self.config.request_timeout())
            .await?;

        if response.status_code > 201 {
            if let Ok(route) = msg.route() {
                self.error_stats.log(&route.service);
            }
        }

        let mut reply = UmfMessage::new(msg.from.clone(), self.self_from(), response.to_body());
        reply.rmid = Some(msg.mid.clone());
        Ok(reply)
    }
}
