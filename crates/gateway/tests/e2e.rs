//! End-to-end scenarios driven against the compiled gateway binary: a fake
//! upstream or two, a generated config file, and plain HTTP against the
//! real listener. Mirrors the concrete scenarios the gateway is expected to
//! satisfy (merged catalogs, correct routing, SSE framing, graceful
//! degradation, unknown-tool handling, push round-trips).

use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::Duration;

use mcp_fed_test_support::{pick_unused_port, spawn_fake_upstream, wait_http_ok, KillOnDrop};
use serde_json::{json, Value};

struct Gateway {
    base_url: String,
    _child: KillOnDrop,
    _config_file: tempfile::NamedTempFile,
}

async fn start_gateway(config_yaml: &str) -> Gateway {
    let port = pick_unused_port().expect("pick port");
    let mut config_file = tempfile::NamedTempFile::new().expect("create temp config");
    write!(config_file, "{config_yaml}").expect("write temp config");

    let bin = env!("CARGO_BIN_EXE_mcp-fed-gatewayd");
    let child = Command::new(bin)
        .arg("--config")
        .arg(config_file.path())
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gateway binary");

    let base_url = format!("http://127.0.0.1:{port}");
    wait_http_ok(&base_url, Duration::from_secs(10))
        .await
        .expect("gateway did not become ready");

    Gateway {
        base_url,
        _child: KillOnDrop(child),
        _config_file: config_file,
    }
}

async fn rpc(base_url: &str, method: &str, params: Value, id: i64) -> Value {
    let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    reqwest::Client::new()
        .post(format!("{base_url}/mcp"))
        .json(&body)
        .send()
        .await
        .expect("post /mcp")
        .json()
        .await
        .expect("parse response")
}

#[tokio::test]
async fn list_merges_prefixes_and_native_tools() {
    let a = spawn_fake_upstream(json!([{"name": "x", "description": "x tool", "inputSchema": {}}]), false).await;
    let b = spawn_fake_upstream(
        json!([
            {"name": "x", "description": "x tool", "inputSchema": {}},
            {"name": "y", "description": "y tool", "inputSchema": {}},
        ]),
        false,
    )
    .await;

    let config = format!(
        r#"
bind: "127.0.0.1:0"
upstreams:
  - name: a
    url: "http://{a_addr}/mcp"
    prefix: a
    priority: 1
    healthEnabled: false
  - name: b
    url: "http://{b_addr}/mcp"
    prefix: b
    priority: 2
    healthEnabled: false
"#,
        a_addr = a.addr,
        b_addr = b.addr,
    );
    let gateway = start_gateway(&config).await;

    let response = rpc(&gateway.base_url, "tools/list", json!({}), 1).await;
    let names: std::collections::HashSet<String> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();

    assert!(names.contains("a_x"));
    assert!(names.contains("b_x"));
    assert!(names.contains("b_y"));
    assert!(names.contains("gateway_status"));
    assert!(names.contains("hivemind_write"));
    assert!(names.contains("hivemind_read"));
}

#[tokio::test]
async fn call_routes_correctly_to_upstream() {
    let b = spawn_fake_upstream(json!([{"name": "y", "description": "", "inputSchema": {}}]), false).await;
    let config = format!(
        r#"
bind: "127.0.0.1:0"
upstreams:
  - name: b
    url: "http://{addr}/mcp"
    prefix: b
    priority: 1
    healthEnabled: false
"#,
        addr = b.addr,
    );
    let gateway = start_gateway(&config).await;
    rpc(&gateway.base_url, "tools/list", json!({}), 1).await;

    let response = rpc(
        &gateway.base_url,
        "tools/call",
        json!({"name": "b_y", "arguments": {"k": 1}}),
        2,
    )
    .await;

    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let echoed: Value = serde_json::from_str(text).unwrap();
    assert_eq!(echoed["name"], "y");
    assert_eq!(echoed["arguments"], json!({"k": 1}));
}

#[tokio::test]
async fn sse_framed_upstream_is_catalogued() {
    let c = spawn_fake_upstream(json!([{"name": "z", "description": "", "inputSchema": {}}]), true).await;
    let config = format!(
        r#"
bind: "127.0.0.1:0"
upstreams:
  - name: c
    url: "http://{addr}/mcp"
    prefix: c
    priority: 1
    framing: sse
    healthEnabled: false
"#,
        addr = c.addr,
    );
    let gateway = start_gateway(&config).await;

    let response = rpc(&gateway.base_url, "tools/list", json!({}), 1).await;
    let names: Vec<String> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"c_z".to_string()));
}

#[tokio::test]
async fn upstream_down_is_not_fatal() {
    let dead_port = pick_unused_port().expect("pick dead port");
    let config = format!(
        r#"
bind: "127.0.0.1:0"
upstreams:
  - name: d
    url: "http://127.0.0.1:{dead_port}/mcp"
    prefix: d
    priority: 1
    healthEnabled: true
"#,
    );
    let gateway = start_gateway(&config).await;

    let list = rpc(&gateway.base_url, "tools/list", json!({}), 1).await;
    assert!(list["result"]["tools"].as_array().is_some());

    let status = rpc(&gateway.base_url, "tools/call", json!({"name": "gateway_status", "arguments": {}}), 2).await;
    let text = status["result"]["content"][0]["text"].as_str().unwrap();
    let parsed: Value = serde_json::from_str(text).unwrap();
    let backend = &parsed["health"]["backends"]["d"];
    assert_eq!(backend["status"], "unhealthy");
    assert!(!backend["lastError"].is_null());
}

#[tokio::test]
async fn unknown_tool_is_a_tool_level_error_not_a_protocol_error() {
    let gateway = start_gateway("bind: \"127.0.0.1:0\"\nupstreams: []\n").await;

    let response = rpc(&gateway.base_url, "tools/call", json!({"name": "nonexistent"}), 7).await;
    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
    assert_eq!(
        response["result"]["content"][0]["text"],
        "Error: Unknown tool 'nonexistent'"
    );
}

#[tokio::test]
async fn push_round_trip_delivers_initialize_response() {
    let gateway = start_gateway("bind: \"127.0.0.1:0\"\nupstreams: []\n").await;

    let http = reqwest::Client::new();
    let mut stream = http
        .get(format!("{}/events", gateway.base_url))
        .header("accept", "text/event-stream")
        .send()
        .await
        .expect("open push stream");

    let first_chunk = stream.chunk().await.expect("read chunk").expect("non-empty");
    let first_text = String::from_utf8_lossy(&first_chunk);
    assert!(first_text.contains("event: endpoint"));
    let endpoint_path = first_text
        .lines()
        .find_map(|l| l.strip_prefix("data: "))
        .expect("endpoint data line")
        .trim()
        .to_string();

    let ack: Value = http
        .post(format!("{}{endpoint_path}", gateway.base_url))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .expect("post session message")
        .json()
        .await
        .expect("parse ack");
    assert_eq!(ack["status"], "ok");

    let next_chunk = stream.chunk().await.expect("read chunk").expect("non-empty");
    let next_text = String::from_utf8_lossy(&next_chunk);
    assert!(next_text.contains("event: message"));
    assert!(next_text.contains("protocolVersion"));
}
