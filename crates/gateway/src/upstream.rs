use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Framing, UpstreamConfig};
use crate::protocol::UpstreamEnvelope;

/// Everything that can go wrong calling a single upstream. Never fatal to
/// the process; callers fold this into a health record or a tool-level
/// error text.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    #[error("timeout")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned http {0}")]
    BadStatus(u16),
    #[error("parse error")]
    ParseError,
    #[error("empty response")]
    EmptyResponse,
}

/// Invokes exactly one upstream over HTTP and decodes its response
/// according to that upstream's configured framing. Holds one shared
/// `reqwest::Client` across every upstream and every call.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// `Call(upstream, method, params, timeout) -> Envelope | ErrorKind`.
    pub async fn call(
        &self,
        upstream: &UpstreamConfig,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<UpstreamEnvelope, UpstreamError> {
        let started = Instant::now();
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut req = self
            .http
            .post(&upstream.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body);
        for (k, v) in &upstream.extra_headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let result = tokio::time::timeout(timeout, req.send()).await;
        let elapsed_ms = started.elapsed().as_millis();

        let response = match result {
            Err(_) => {
                warn!(upstream = %upstream.name, method, elapsed_ms, "upstream call timed out");
                return Err(UpstreamError::Timeout);
            }
            Ok(Err(e)) => {
                warn!(upstream = %upstream.name, method, elapsed_ms, error = %e, "upstream transport error");
                return Err(UpstreamError::Transport(e.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            warn!(upstream = %upstream.name, method, elapsed_ms, status = status.as_u16(), "upstream returned non-success status");
            return Err(UpstreamError::BadStatus(status.as_u16()));
        }

        let text = response.text().await.map_err(|e| {
            warn!(upstream = %upstream.name, method, error = %e, "failed to read upstream response body");
            UpstreamError::Transport(e.to_string())
        })?;
        if text.is_empty() {
            return Err(UpstreamError::EmptyResponse);
        }

        let envelope = decode(&text, upstream.framing)?;
        debug!(upstream = %upstream.name, method, elapsed_ms, "upstream call completed");
        Ok(envelope)
    }

    /// `Probe(upstream) -> bool`. GETs the root URL derived by stripping a
    /// trailing `/mcp` path segment. A retry against `alt_url` only happens
    /// when the primary request itself fails (timeout, connection error);
    /// a primary response that comes back with a non-200 status is treated
    /// as a definitive "unhealthy", with no fallback.
    pub async fn probe(&self, upstream: &UpstreamConfig) -> bool {
        match self.probe_url(&strip_mcp_suffix(&upstream.url)).await {
            Ok(healthy) => healthy,
            Err(()) => {
                if let Some(alt) = &upstream.alt_url {
                    self.probe_url(&strip_mcp_suffix(alt)).await.unwrap_or(false)
                } else {
                    false
                }
            }
        }
    }

    /// `Ok(true/false)` for a request that completed; `Err(())` only when the
    /// request itself couldn't be made (the original's distinction between a
    /// caught exception and a plain non-200 response).
    async fn probe_url(&self, url: &str) -> Result<bool, ()> {
        match self
            .http
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => Ok(response.status() == reqwest::StatusCode::OK),
            Err(_) => Err(()),
        }
    }
}

fn strip_mcp_suffix(url: &str) -> String {
    url.strip_suffix("/mcp")
        .map(|s| format!("{s}/"))
        .unwrap_or_else(|| url.to_string())
}

/// Decode rule driven by `upstream.framing`. `Json` expects a single JSON
/// object body; `Sse` scans for the first `data: ` line and parses its
/// remainder, ignoring every other line.
pub fn decode(body: &str, framing: Framing) -> Result<UpstreamEnvelope, UpstreamError> {
    match framing {
        Framing::Json => serde_json::from_str(body).map_err(|_| UpstreamError::ParseError),
        Framing::Sse => decode_sse(body),
    }
}

fn decode_sse(body: &str) -> Result<UpstreamEnvelope, UpstreamError> {
    for line in body.split('\n') {
        if let Some(rest) = line.strip_prefix("data: ") {
            if let Ok(envelope) = serde_json::from_str::<UpstreamEnvelope>(rest) {
                return Ok(envelope);
            }
        }
    }
    Err(UpstreamError::ParseError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_framing_parses_plain_body() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        let envelope = decode(body, Framing::Json).unwrap();
        assert!(envelope.result.is_some());
    }

    #[test]
    fn sse_framing_finds_first_data_line() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[{\"name\":\"z\"}]}}\n\n";
        let envelope = decode(body, Framing::Sse).unwrap();
        let tools = envelope.result.unwrap()["tools"].clone();
        assert_eq!(tools[0]["name"], "z");
    }

    #[test]
    fn sse_framing_ignores_non_data_lines() {
        let body = ": keepalive\nevent: message\nsomething else\ndata: {\"result\":{\"ok\":true}}\n\n";
        let envelope = decode(body, Framing::Sse).unwrap();
        assert_eq!(envelope.result.unwrap()["ok"], true);
    }

    #[test]
    fn sse_framing_with_no_data_line_is_parse_error() {
        let body = "event: message\nfoo\n\n";
        assert!(matches!(decode(body, Framing::Sse), Err(UpstreamError::ParseError)));
    }

    #[test]
    fn strip_mcp_suffix_strips_trailing_segment() {
        assert_eq!(strip_mcp_suffix("https://example/mcp"), "https://example/");
        assert_eq!(strip_mcp_suffix("https://example/other"), "https://example/other");
    }
}
