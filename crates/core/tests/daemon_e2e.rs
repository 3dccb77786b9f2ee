//! Daemon surface end-to-end over the Unix socket: status, message
//! submission, territory status, and the escalation verdict round trip.

use std::path::Path;
use std::sync::Arc;

use conclave_core::Core;
use conclave_core::config::Config;
use conclave_core::daemon;
use conclave_core::domain::lease::ResourceKey;
use conclave_core::domain::message::{AgentId, Priority, SenderRole};
use conclave_core::territory::Decision;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

fn quiet_config() -> Config {
  let mut cfg = Config::default();
  cfg.clones.pool_target = 0;
  cfg.clones.pool_low_water = 0;
  cfg
}

/// Minimal JSON-RPC-over-HTTP client for the daemon's Unix socket.
async fn rpc(socket: &Path, method: &str, params: Value) -> Value {
  let mut stream = UnixStream::connect(socket).await.expect("connect socket");
  let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}).to_string();
  let request = format!(
    "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    body.len(),
    body
  );
  stream.write_all(request.as_bytes()).await.expect("write request");
  let mut raw = Vec::new();
  stream.read_to_end(&mut raw).await.expect("read response");
  let text = String::from_utf8_lossy(&raw);
  let (head, mut payload) = text
    .split_once("\r\n\r\n")
    .expect("http response has a header block");
  let chunked = head
    .to_ascii_lowercase()
    .contains("transfer-encoding: chunked");
  let decoded;
  if chunked {
    decoded = dechunk(payload);
    payload = &decoded;
  }
  let response: Value = serde_json::from_str(payload.trim()).expect("json body");
  assert_eq!(response["jsonrpc"], "2.0", "rpc error: {}", response);
  response
}

fn dechunk(body: &str) -> String {
  let mut out = String::new();
  let mut rest = body;
  while let Some((size_line, tail)) = rest.split_once("\r\n") {
    let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
    if size == 0 {
      break;
    }
    out.push_str(&tail[..size]);
    rest = tail[size..].trim_start_matches("\r\n");
  }
  out
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_surface_round_trip() {
  let td = tempfile::tempdir().unwrap();
  let socket = td.path().join("conclave.sock");
  let core = Core::new(quiet_config(), td.path()).unwrap();
  let handle = daemon::start(Arc::clone(&core), &socket).await.unwrap();

  // daemon.status
  let status = rpc(&socket, "daemon.status", json!([])).await;
  assert_eq!(status["result"]["version"], env!("CARGO_PKG_VERSION"));
  assert_eq!(status["result"]["socket_path"], socket.display().to_string());

  // message.send: a gated message to an unconnected agent stays queued.
  let sent = rpc(
    &socket,
    "message.send",
    json!({"to": "a1", "priority": "info", "body": "hello"}),
  )
  .await;
  assert!(sent["result"]["id"].is_string());

  let territory = rpc(&socket, "territory.status", json!([])).await;
  assert!(territory["result"]["queues"]["total"].as_u64().unwrap() >= 1);

  // Drive a queue-depth escalation directly on the shared core, then
  // resolve it over the wire. The holder is nearly done, so the first two
  // contenders defer and queue; the third trips the depth threshold.
  core
    .registry()
    .attach_virtual(AgentId::from("a1"), SenderRole::Agent);
  let resource = ResourceKey::new("api/users.ts");
  core.request_lease(AgentId::from("h"), resource.clone(), Some(20), Priority::Coordinate);
  core
    .territory()
    .progress(&AgentId::from("h"), &resource, 0.1)
    .unwrap();
  core.request_lease(AgentId::from("r1"), resource.clone(), Some(60), Priority::Coordinate);
  core.request_lease(AgentId::from("r2"), resource.clone(), Some(60), Priority::Coordinate);
  let escalated = matches!(
    core.request_lease(AgentId::from("r3"), resource.clone(), Some(60), Priority::Coordinate),
    Decision::Escalate(_)
  );
  assert!(escalated);

  let listed = rpc(&socket, "escalation.list", json!([])).await;
  let escalations = listed["result"]["escalations"].as_array().unwrap();
  assert_eq!(escalations.len(), 1);
  let id = escalations[0]["id"].clone();

  let resolved = rpc(
    &socket,
    "escalation.resolve",
    json!({"id": id, "verdict": "force_grant"}),
  )
  .await;
  assert_eq!(resolved["result"], json!(true));
  let table = core.territory().lease_table();
  assert_eq!(table[&resource].holder, Some(AgentId::from("r3")));

  // daemon.shutdown stops both the server and the core loop.
  let down = rpc(&socket, "daemon.shutdown", json!([])).await;
  assert_eq!(down["result"], json!(true));
  handle.wait().await;
  assert!(!socket.exists());
}
