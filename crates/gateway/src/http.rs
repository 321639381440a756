use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde_json::Value;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::GatewayConfig;
use crate::native::NativeTools;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
use crate::router::Router as DispatchRouter;
use crate::sessions::SessionsRegistry;
use crate::upstream::UpstreamClient;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub catalog: Arc<Catalog>,
    pub client: UpstreamClient,
    pub native: Arc<NativeTools>,
    pub router: Arc<DispatchRouter>,
    pub sessions: Arc<SessionsRegistry>,
}

#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/mcp", post(mcp_handler))
        .route("/events", get(open_push_stream))
        .route("/events/{session_id}/message", post(push_message))
        .route("/refresh", post(force_refresh))
        .route("/tools", get(list_tools_grouped))
        .route("/health", get(detailed_health))
        .with_state(state)
}

async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    let total_tools = state.catalog.tool_count() + state.native.schemas().len();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "mcp-federation-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["mcp-proxy", "sse-transport", "health-monitoring", "native-hivemind", "graceful-fallback"],
        "backends": state.config.upstreams.iter().map(|u| u.name.clone()).collect::<Vec<_>>(),
        "toolCount": total_tools,
    }))
}

async fn mcp_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let parsed = serde_json::from_str::<JsonRpcRequest>(&body);
    let Ok(request) = parsed else {
        return Json(JsonRpcResponse::failure(
            Value::Null,
            JsonRpcError::new(JsonRpcError::PARSE_ERROR, "Parse error"),
        ));
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    let response = process_request_guarded(state, request).await;
    Json(JsonRpcResponse { id, ..response })
}

async fn open_push_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let session = state.sessions.create();
    info!(session = %session.id, "push stream opened");

    let session_id = session.id.clone();
    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        id: session_id.clone(),
    };
    let stream = stream::unfold(
        (session, session_id, guard, true),
        |(session, session_id, guard, first)| async move {
            if first {
                return Some((Ok(endpoint_event_for(&session_id)), (session, session_id, guard, false)));
            }
            match session.recv(KEEPALIVE_INTERVAL).await {
                Some(envelope) => {
                    let event = Event::default().event("message").data(envelope.to_string());
                    Some((Ok(event), (session, session_id, guard, false)))
                }
                None => Some((Ok(Event::default().comment("keepalive")), (session, session_id, guard, false))),
            }
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
}

fn endpoint_event_for(session_id: &str) -> Event {
    Event::default()
        .event("endpoint")
        .data(format!("/events/{session_id}/message"))
}

/// Removes the session from the registry when the push stream future is
/// dropped (client disconnect, or process shutdown tearing down handlers).
struct SessionGuard {
    sessions: Arc<SessionsRegistry>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

async fn push_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let Some(session) = state.sessions.get(&session_id) else {
        return Json(serde_json::json!({"error": "Session not found"}));
    };

    let Ok(request) = serde_json::from_str::<JsonRpcRequest>(&body) else {
        return Json(serde_json::json!({"error": "No data"}));
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    let response = process_request_guarded(state, request).await;
    let envelope = JsonRpcResponse { id, ..response };
    session.push(serde_json::to_value(envelope).unwrap_or(Value::Null));

    Json(serde_json::json!({"status": "ok"}))
}

async fn force_refresh(State(state): State<AppState>) -> impl IntoResponse {
    state.catalog.force_refresh(&state.client).await;
    let report = state.catalog.health_report();
    Json(serde_json::json!({
        "status": "refreshed",
        "toolCount": state.catalog.tool_count() + state.native.schemas().len(),
        "timestamp": report.last_refresh,
        "health": report,
    }))
}

async fn list_tools_grouped(State(state): State<AppState>) -> impl IntoResponse {
    state.catalog.ensure_fresh(&state.client).await;

    let mut backends: serde_json::Map<String, Value> = serde_json::Map::new();
    backends.insert(
        "_native".to_string(),
        serde_json::json!(state
            .native
            .schemas()
            .iter()
            .map(|s| serde_json::json!({"name": s.name, "description": s.description}))
            .collect::<Vec<_>>()),
    );

    for schema in state.catalog.list() {
        if let Some(entry) = state.catalog.lookup(&schema.name) {
            let backend = entry.upstream.name.clone();
            let list = backends
                .entry(backend)
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(arr) = list {
                arr.push(serde_json::json!({
                    "prefixedName": entry.prefixed_name,
                    "originalName": entry.original_name,
                    "description": schema.description,
                }));
            }
        }
    }

    let report = state.catalog.health_report();
    Json(serde_json::json!({
        "toolCount": state.catalog.tool_count() + state.native.schemas().len(),
        "backends": backends,
        "health": report,
    }))
}

async fn detailed_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.catalog.health_report())
}

/// Runs `process_request` on a spawned task so a panic anywhere in method
/// dispatch (a native tool, a malformed upstream body) surfaces as a
/// JSON-RPC internal error instead of taking the whole connection down.
async fn process_request_guarded(state: AppState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);
    match tokio::spawn(async move { process_request(&state, request).await }).await {
        Ok(response) => response,
        Err(join_err) => {
            tracing::error!(error = %join_err, "panic handling request");
            JsonRpcResponse::failure(
                id,
                JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, "Internal error"),
            )
        }
    }
}

async fn process_request(state: &AppState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            serde_json::json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mcp-federation-gateway", "version": env!("CARGO_PKG_VERSION")},
            }),
        ),
        "notifications/initialized" => JsonRpcResponse::success(id, serde_json::json!({})),
        "tools/list" => {
            state.catalog.ensure_fresh(&state.client).await;
            let mut tools: Vec<Value> = state
                .catalog
                .list()
                .into_iter()
                .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
                .collect();
            tools.extend(
                state
                    .native
                    .schemas()
                    .into_iter()
                    .map(|t| serde_json::to_value(t).unwrap_or(Value::Null)),
            );
            JsonRpcResponse::success(id, serde_json::json!({"tools": tools}))
        }
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            let result = state.router.dispatch(&name, arguments).await;
            JsonRpcResponse::success(id, result)
        }
        other => JsonRpcResponse::failure(
            id,
            JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        ),
    }
}
