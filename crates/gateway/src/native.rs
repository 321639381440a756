use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::{ToolCallResult, ToolSchema};
use crate::router::Router;

/// The catalog entry this gateway expects for shared-memory persistence.
/// Resolved at call time via `Catalog::lookup`; if the upstream that
/// provides it isn't in the catalog, the native tool degrades to a
/// tool-level error rather than taking down the gateway.
const HIVE_MIND_SQL_TOOL: &str = "sm_query_snowflake";

#[async_trait]
pub trait NativeTool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn call(&self, arguments: Value, router: &Router) -> Value;
}

/// A small, fixed table of gateway-local tools, keyed by the unprefixed name
/// the client sees directly. Built once at startup.
pub struct NativeTools {
    tools: HashMap<&'static str, Box<dyn NativeTool>>,
}

impl NativeTools {
    #[must_use]
    pub fn new() -> Self {
        let mut tools: HashMap<&'static str, Box<dyn NativeTool>> = HashMap::new();
        tools.insert("gateway_status", Box::new(GatewayStatus));
        tools.insert("hivemind_write", Box::new(HivemindWrite));
        tools.insert("hivemind_read", Box::new(HivemindRead));
        Self { tools }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn NativeTool> {
        self.tools.get(name).map(std::convert::AsRef::as_ref)
    }

    #[must_use]
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }
}

impl Default for NativeTools {
    fn default() -> Self {
        Self::new()
    }
}

struct GatewayStatus;

#[async_trait]
impl NativeTool for GatewayStatus {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "gateway_status".to_string(),
            description: "[GATEWAY] Get the status of all MCP backends and health information"
                .to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            extra: serde_json::Map::new(),
        }
    }

    async fn call(&self, _arguments: Value, router: &Router) -> Value {
        let report = router.catalog().health_report();
        let body = serde_json::json!({
            "gateway": "mcp-federation-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "health": report,
        });
        ToolCallResult::ok_text(serde_json::to_string_pretty(&body).unwrap_or_default())
            .into_value()
    }
}

struct HivemindWrite;

#[async_trait]
impl NativeTool for HivemindWrite {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "hivemind_write".to_string(),
            description: "[GATEWAY] Write an entry to the shared hive-mind memory".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "source": {"type": "string", "description": "Source identifier"},
                    "category": {"type": "string", "description": "Category: CONTEXT, DECISION, ACTION_ITEM, etc"},
                    "workstream": {"type": "string", "description": "Workstream or project name", "default": "GENERAL"},
                    "summary": {"type": "string", "description": "Clear summary", "maxLength": 2000},
                    "details": {"type": "object", "description": "JSON details object"},
                    "priority": {"type": "string", "enum": ["HIGH", "MEDIUM", "LOW"], "default": "MEDIUM"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["source", "category", "summary"]
            }),
            extra: serde_json::Map::new(),
        }
    }

    async fn call(&self, arguments: Value, router: &Router) -> Value {
        if router.catalog().lookup(HIVE_MIND_SQL_TOOL).is_none() {
            return ToolCallResult::error_text("Error: Snowflake backend not available")
                .into_value();
        }

        let source = arguments.get("source").and_then(Value::as_str).unwrap_or("GATEWAY");
        let category = arguments.get("category").and_then(Value::as_str).unwrap_or("CONTEXT");
        let workstream = arguments.get("workstream").and_then(Value::as_str).unwrap_or("GENERAL");
        let summary = arguments.get("summary").and_then(Value::as_str).unwrap_or("");
        let priority = arguments.get("priority").and_then(Value::as_str).unwrap_or("MEDIUM");
        let details_json = arguments
            .get("details")
            .map(ToString::to_string)
            .unwrap_or_else(|| "NULL".to_string());
        let tags_json = arguments
            .get("tags")
            .filter(|v| !matches!(v, Value::Array(a) if a.is_empty()))
            .map(ToString::to_string)
            .unwrap_or_else(|| "NULL".to_string());

        let sql = format!(
            "INSERT INTO SOVEREIGN_MIND.RAW.HIVE_MIND (SOURCE, CATEGORY, WORKSTREAM, SUMMARY, DETAILS, PRIORITY, STATUS, TAGS) VALUES ('{}', '{}', '{}', '{}', PARSE_JSON('{}'), '{}', 'ACTIVE', PARSE_JSON('{}'))",
            sql_quote(source),
            sql_quote(category),
            sql_quote(workstream),
            sql_quote(summary),
            sql_quote(&details_json),
            sql_quote(priority),
            sql_quote(&tags_json),
        );

        let result = router
            .call_upstream_tool(HIVE_MIND_SQL_TOOL, serde_json::json!({"sql": sql}))
            .await;
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
        if is_error {
            let backend_text = result
                .get("content")
                .and_then(Value::as_array)
                .and_then(|blocks| blocks.first())
                .and_then(|block| block.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            return ToolCallResult::error_text(format!(
                "Error writing to Hive Mind: {backend_text}"
            ))
            .into_value();
        }
        ToolCallResult::ok_text("Hive Mind entry created successfully").into_value()
    }
}

struct HivemindRead;

#[async_trait]
impl NativeTool for HivemindRead {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "hivemind_read".to_string(),
            description: "[GATEWAY] Read recent entries from the shared hive-mind memory"
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "default": 10, "maximum": 50},
                    "category": {"type": "string"},
                    "source": {"type": "string"},
                    "workstream": {"type": "string"}
                }
            }),
            extra: serde_json::Map::new(),
        }
    }

    async fn call(&self, arguments: Value, router: &Router) -> Value {
        if router.catalog().lookup(HIVE_MIND_SQL_TOOL).is_none() {
            return ToolCallResult::error_text("Error: Snowflake backend not available")
                .into_value();
        }

        let limit = arguments.get("limit").and_then(Value::as_i64).unwrap_or(10);

        let mut conditions = Vec::new();
        if let Some(v) = arguments.get("category").and_then(Value::as_str) {
            conditions.push(format!("CATEGORY = '{}'", sql_quote(v)));
        }
        if let Some(v) = arguments.get("source").and_then(Value::as_str) {
            conditions.push(format!("SOURCE = '{}'", sql_quote(v)));
        }
        if let Some(v) = arguments.get("workstream").and_then(Value::as_str) {
            conditions.push(format!("WORKSTREAM = '{}'", sql_quote(v)));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT ID, CREATED_AT, SOURCE, CATEGORY, WORKSTREAM, SUMMARY, PRIORITY, STATUS FROM SOVEREIGN_MIND.RAW.HIVE_MIND {where_clause} ORDER BY CREATED_AT DESC LIMIT {limit}"
        );

        router
            .call_upstream_tool(HIVE_MIND_SQL_TOOL, serde_json::json!({"sql": sql}))
            .await
    }
}

/// SQL single-quote doubling, matching the one escaping rule the configured
/// upstream tool is known to expect. Not a general-purpose SQL sanitizer.
fn sql_quote(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_quote_doubles_single_quotes() {
        assert_eq!(sql_quote("O'Brien"), "O''Brien");
        assert_eq!(sql_quote("no quotes"), "no quotes");
        assert_eq!(sql_quote("a''b"), "a''''b");
    }

    #[test]
    fn registry_has_three_native_tools() {
        let tools = NativeTools::new();
        assert!(tools.get("gateway_status").is_some());
        assert!(tools.get("hivemind_write").is_some());
        assert!(tools.get("hivemind_read").is_some());
        assert!(tools.get("nope").is_none());
        assert_eq!(tools.schemas().len(), 3);
    }
}
