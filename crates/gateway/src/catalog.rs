use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::{GatewayConfig, UpstreamConfig};
use crate::protocol::ToolSchema;
use crate::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<String>,
}

impl HealthRecord {
    fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            tool_count: 0,
            last_error: None,
            last_probe_at: None,
        }
    }
}

#[derive(Clone)]
pub struct CatalogEntry {
    pub prefixed_name: String,
    pub original_name: String,
    pub upstream: Arc<UpstreamConfig>,
    pub schema: ToolSchema,
}

struct CatalogState {
    entries: HashMap<String, CatalogEntry>,
    health: HashMap<String, HealthRecord>,
    last_refresh_at: Option<Instant>,
}

impl CatalogState {
    fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            health: HashMap::new(),
            last_refresh_at: None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub last_refresh: Option<String>,
    pub total_tools: usize,
    pub backends: HashMap<String, HealthRecord>,
}

/// The merged tool directory across every enabled upstream, plus per-upstream
/// health. Created once at startup, mutated only by `refresh`, read
/// concurrently by every request.
pub struct Catalog {
    config: Arc<GatewayConfig>,
    state: RwLock<CatalogState>,
    refresh_lock: AsyncMutex<()>,
}

impl Catalog {
    #[must_use]
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self {
            config,
            state: RwLock::new(CatalogState::empty()),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    fn needs_refresh(&self) -> bool {
        let state = self.state.read();
        match state.last_refresh_at {
            None => true,
            Some(at) => at.elapsed() > self.config.refresh_ttl(),
        }
    }

    /// Refreshes if stale, otherwise returns immediately. Concurrent callers
    /// that observe staleness join the one in-flight refresh rather than
    /// starting a second one: they block on the same lock, and re-check
    /// staleness after acquiring it.
    pub async fn ensure_fresh(&self, client: &UpstreamClient) {
        if !self.needs_refresh() {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        if self.needs_refresh() {
            self.refresh(client).await;
        }
    }

    pub async fn force_refresh(&self, client: &UpstreamClient) {
        let _guard = self.refresh_lock.lock().await;
        self.refresh(client).await;
    }

    /// Rebuilds the catalog from every enabled upstream, lowest-priority
    /// first, then commits entries and health atomically. Readers never see
    /// a mixed pre/post-refresh state.
    async fn refresh(&self, client: &UpstreamClient) {
        info!("refreshing tool catalog from upstream MCP servers");
        let upstreams = self.config.enabled_upstreams();

        let mut staged_entries: HashMap<String, CatalogEntry> = HashMap::new();
        let mut staged_health: HashMap<String, HealthRecord> = HashMap::new();
        let mut healthy_count = 0usize;

        for upstream in &upstreams {
            let mut record = HealthRecord::unknown();
            record.last_probe_at = Some(now_iso());

            if upstream.health_enabled && !client.probe(upstream).await {
                record.status = HealthStatus::Unhealthy;
                record.last_error = Some("health check failed".to_string());
                warn!(upstream = %upstream.name, "health check failed, skipping");
                staged_health.insert(upstream.name.clone(), record);
                continue;
            }

            let call = client
                .call(
                    upstream,
                    "tools/list",
                    Value::Object(serde_json::Map::new()),
                    upstream.request_timeout(),
                )
                .await;

            match call {
                Err(e) => {
                    record.status = match e {
                        UpstreamError::Timeout => HealthStatus::Timeout,
                        _ => HealthStatus::Error,
                    };
                    record.last_error = Some(e.to_string());
                    warn!(upstream = %upstream.name, error = %e, "tools/list failed");
                }
                Ok(envelope) => {
                    let Some(result) = envelope.result else {
                        record.status = HealthStatus::Error;
                        record.last_error = Some("could not parse response".to_string());
                        staged_health.insert(upstream.name.clone(), record);
                        continue;
                    };
                    let tools = result
                        .get("tools")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();

                    let upstream_arc = Arc::new((*upstream).clone());
                    let mut conflicts = Vec::new();
                    for raw in &tools {
                        let Some(original_name) = raw.get("name").and_then(Value::as_str) else {
                            continue;
                        };
                        let original_name = original_name.to_string();
                        let prefixed_name = format!("{}_{original_name}", upstream.prefix);

                        // Deserialize the whole raw object so fields the gateway doesn't
                        // know about (annotations, outputSchema, ...) survive in `extra`
                        // rather than being dropped.
                        let Ok(mut schema) = serde_json::from_value::<ToolSchema>(raw.clone())
                        else {
                            continue;
                        };
                        let description = schema.description.clone();
                        schema.name = prefixed_name.clone();
                        schema.description =
                            format!("[{}] {description}", upstream.prefix.to_uppercase());

                        if staged_entries.contains_key(&prefixed_name) {
                            conflicts.push(prefixed_name);
                            continue;
                        }

                        staged_entries.insert(
                            prefixed_name.clone(),
                            CatalogEntry {
                                prefixed_name,
                                original_name,
                                upstream: upstream_arc.clone(),
                                schema,
                            },
                        );
                    }

                    record.status = HealthStatus::Healthy;
                    record.tool_count = tools.len();
                    if !conflicts.is_empty() {
                        warn!(upstream = %upstream.name, ?conflicts, "dropped colliding tool names");
                        record.last_error =
                            Some(format!("dropped colliding tool name(s): {}", conflicts.join(", ")));
                    }
                    healthy_count += 1;
                    info!(upstream = %upstream.name, tools = tools.len(), "upstream catalog loaded");
                }
            }

            staged_health.insert(upstream.name.clone(), record);
        }

        let total_tools = staged_entries.len();
        {
            let mut state = self.state.write();
            state.entries = staged_entries;
            state.health = staged_health;
            state.last_refresh_at = Some(Instant::now());
        }

        info!(
            total_tools,
            healthy_backends = healthy_count,
            total_backends = upstreams.len(),
            "catalog refreshed"
        );
    }

    /// `List() -> [ToolSchema]`. Does not itself refresh; callers decide
    /// whether to call `ensure_fresh` first.
    #[must_use]
    pub fn list(&self) -> Vec<ToolSchema> {
        self.state
            .read()
            .entries
            .values()
            .map(|e| e.schema.clone())
            .collect()
    }

    #[must_use]
    pub fn lookup(&self, prefixed_name: &str) -> Option<CatalogEntry> {
        self.state.read().entries.get(prefixed_name).cloned()
    }

    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let state = self.state.read();
        HealthReport {
            last_refresh: state.last_refresh_at.map(|_| now_iso()),
            total_tools: state.entries.len(),
            backends: state.health.clone(),
        }
    }

    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.state.read().entries.len()
    }
}

fn now_iso() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    secs.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Framing;

    fn upstream(name: &str, prefix: &str, priority: i64) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            url: format!("http://example/{name}/mcp"),
            prefix: prefix.to_string(),
            enabled: true,
            framing: Framing::Json,
            extra_headers: HashMap::new(),
            request_timeout_secs: 30,
            health_enabled: false,
            alt_url: None,
            priority,
        }
    }

    #[test]
    fn needs_refresh_initially_true() {
        let config = Arc::new(GatewayConfig {
            bind: "0.0.0.0:0".to_string(),
            refresh_ttl_secs: 300,
            upstreams: vec![upstream("a", "a", 1)],
        });
        let catalog = Catalog::new(config);
        assert!(catalog.needs_refresh());
        assert_eq!(catalog.tool_count(), 0);
    }
}
