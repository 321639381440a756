use anyhow::Context as _;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use std::net::TcpListener;
use std::process::Child;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

/// Pick an unused TCP port on localhost.
///
/// Note: this does not reserve the port; it's still possible for another process to bind it
/// before you do.
///
/// # Errors
///
/// Returns an error if binding an ephemeral localhost port fails or if the bound socket's
/// local address cannot be read.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Poll an HTTP URL until it returns a success status (2xx/3xx).
///
/// # Errors
///
/// Returns an error if the timeout elapses before the endpoint returns a success status.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

/// A minimal in-process fake MCP upstream for gateway integration tests. It
/// answers `tools/list` with a fixed tool set and `tools/call` by echoing
/// the call back as the result, framed either as a plain JSON body or as an
/// SSE `data:` line depending on how it's built.
pub struct FakeUpstream {
    pub addr: std::net::SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
struct FakeUpstreamState {
    tools: Arc<Value>,
    sse: bool,
}

/// Spins up a fake upstream MCP server bound to an ephemeral localhost port.
///
/// # Panics
///
/// Panics if an ephemeral port cannot be bound, which would indicate a
/// broken test environment rather than a test failure to report gracefully.
pub async fn spawn_fake_upstream(tools: Value, sse: bool) -> FakeUpstream {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port for fake upstream");
    let addr = listener.local_addr().expect("read bound addr");

    let state = FakeUpstreamState {
        tools: Arc::new(tools),
        sse,
    };
    let app = Router::new()
        .route("/mcp", post(fake_upstream_handler))
        .route("/", axum::routing::get(|| async { "ok" }))
        .with_state(state);

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
    });

    FakeUpstream {
        addr,
        shutdown: Some(tx),
        handle: Some(handle),
    }
}

async fn fake_upstream_handler(
    State(state): State<FakeUpstreamState>,
    Json(req): Json<Value>,
) -> impl IntoResponse {
    let method = req.get("method").and_then(Value::as_str).unwrap_or("");
    let id = req.get("id").cloned().unwrap_or(Value::from(1));

    let result = match method {
        "tools/list" => serde_json::json!({"tools": *state.tools}),
        "tools/call" => {
            let params = req.get("params").cloned().unwrap_or(Value::Null);
            serde_json::json!({"content": [{"type": "text", "text": params.to_string()}]})
        }
        _ => serde_json::json!({}),
    };

    let envelope = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});

    if state.sse {
        let body = format!("event: message\ndata: {envelope}\n\n");
        (
            [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
            body,
        )
            .into_response()
    } else {
        Json(envelope).into_response()
    }
}
