use std::time::Duration;

use serde_json::Value;

use crate::catalog::Catalog;
use crate::native::NativeTools;
use crate::protocol::ToolCallResult;
use crate::upstream::UpstreamClient;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolves a prefixed tool name to an upstream and original name, forwards
/// the call, and translates the response into a uniform tool-call envelope.
/// Never retries: MCP tool calls have unknown side-effect semantics.
pub struct Router {
    catalog: std::sync::Arc<Catalog>,
    client: UpstreamClient,
    native: std::sync::Arc<NativeTools>,
}

impl Router {
    #[must_use]
    pub fn new(
        catalog: std::sync::Arc<Catalog>,
        client: UpstreamClient,
        native: std::sync::Arc<NativeTools>,
    ) -> Self {
        Self {
            catalog,
            client,
            native,
        }
    }

    /// Returns the tool-call envelope as bare JSON. A successful upstream
    /// call returns its `result` verbatim, untouched by any local struct, so
    /// fields the gateway doesn't model (extra content-block kinds, extra
    /// top-level keys) survive the round trip.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Value {
        if let Some(tool) = self.native.get(name) {
            return tool.call(arguments, self).await;
        }

        let Some(entry) = self.catalog.lookup(name) else {
            return ToolCallResult::error_text(format!("Error: Unknown tool '{name}'")).into_value();
        };

        let timeout = if entry.upstream.request_timeout_secs > 0 {
            entry.upstream.request_timeout()
        } else {
            DEFAULT_CALL_TIMEOUT
        };

        let params = serde_json::json!({
            "name": entry.original_name,
            "arguments": arguments,
        });

        match self
            .client
            .call(&entry.upstream, "tools/call", params, timeout)
            .await
        {
            Ok(envelope) => {
                if let Some(result) = envelope.result {
                    result
                } else if let Some(error) = envelope.error {
                    ToolCallResult::error_text(format!("Backend error: {error}")).into_value()
                } else {
                    ToolCallResult::error_text("No response from backend").into_value()
                }
            }
            Err(e) => ToolCallResult::error_text(format!("Error calling tool: {e}")).into_value(),
        }
    }

    /// Exposed so native tools can re-enter the router to reach a known
    /// upstream (e.g. the shared-memory store) without bypassing its lookup.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn call_upstream_tool(&self, prefixed_name: &str, arguments: Value) -> Value {
        let Some(entry) = self.catalog.lookup(prefixed_name) else {
            return ToolCallResult::error_text(format!("Error: Unknown tool '{prefixed_name}'"))
                .into_value();
        };
        let params = serde_json::json!({
            "name": entry.original_name,
            "arguments": arguments,
        });
        match self
            .client
            .call(&entry.upstream, "tools/call", params, entry.upstream.request_timeout())
            .await
        {
            Ok(envelope) => {
                if let Some(result) = envelope.result {
                    result
                } else if let Some(error) = envelope.error {
                    ToolCallResult::error_text(format!("Backend error: {error}")).into_value()
                } else {
                    ToolCallResult::error_text("No response from backend").into_value()
                }
            }
            Err(e) => ToolCallResult::error_text(format!("Error calling tool: {e}")).into_value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_unknown_tool_returns_tool_level_error() {
        let config = std::sync::Arc::new(crate::config::GatewayConfig {
            bind: "0.0.0.0:0".to_string(),
            refresh_ttl_secs: 300,
            upstreams: vec![],
        });
        let catalog = std::sync::Arc::new(Catalog::new(config));
        let client = UpstreamClient::new(reqwest::Client::new());
        let native = std::sync::Arc::new(NativeTools::new());
        let router = Router::new(catalog, client, native);

        let result = router.dispatch("nonexistent", Value::Null).await;
        assert_eq!(result["isError"], true);
        assert_eq!(
            result["content"][0]["text"],
            "Error: Unknown tool 'nonexistent'"
        );
    }
}
