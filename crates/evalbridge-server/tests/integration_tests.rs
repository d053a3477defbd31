//! Integration tests for the evalbridge server binary.
//!
//! Each test boots the real binary on an auto-assigned port and plays the
//! browser peer with a tokio-tungstenite client.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ServerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }

    fn http(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    async fn connect_peer(&self) -> Peer {
        let (peer, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", self.port))
            .await
            .expect("peer should connect");
        assert!(
            wait_for_session(self.port, true, 5).await,
            "session never became active"
        );
        peer
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn binary_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_evalbridge") {
        return Ok(PathBuf::from(path));
    }
    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("evalbridge");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_evalbridge not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

/// Start the binary with `extra` flags and wait until `/health` answers.
async fn start_server(extra: &[&str]) -> Result<ServerHandle, String> {
    let binary = binary_path()?;

    let mut child = tokio::process::Command::new(&binary)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn evalbridge: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("EVALBRIDGE_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid EVALBRIDGE_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read evalbridge stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port = discovered_port
        .ok_or_else(|| "EVALBRIDGE_PORT line not emitted by evalbridge".to_string())?;
    if health(port).await.is_none() {
        return Err(format!("evalbridge failed health check on port {port}"));
    }

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(ServerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

async fn health(port: u16) -> Option<Value> {
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if let Ok(response) = client
            .get(format!("http://127.0.0.1:{}/health", port))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            if let Ok(json) = response.json::<Value>().await {
                return Some(json);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

/// Wait until `/health` reports the expected session flag.
async fn wait_for_session(port: u16, present: bool, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if let Some(json) = health(port).await {
            if json.get("session").and_then(Value::as_bool) == Some(present) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Post code to `/eval` and return the status and JSON body.
async fn post_eval(server: &ServerHandle, code: &str) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(server.http("/eval"))
        .body(code.to_string())
        .timeout(Duration::from_secs(20))
        .send()
        .await
        .expect("eval request should complete");
    let status = response.status().as_u16();
    let body = response.json::<Value>().await.expect("eval body is JSON");
    (status, body)
}

/// Next JSON text frame from the server, skipping control frames.
async fn next_envelope(peer: &mut Peer) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), peer.next())
            .await
            .expect("server should send a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("frame is JSON");
        }
    }
}

async fn reply(peer: &mut Peer, request: &Value, result: Value) {
    let envelope = json!({"_id": request["_id"], "result": result});
    peer.send(Message::Text(envelope.to_string())).await.unwrap();
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_health_without_peer() {
    let server = start_server(&["--no-watch"]).await.expect("server starts");

    let json = health(server.port).await.unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["session"], false);

    server.stop().await;
}

#[tokio::test]
async fn test_eval_without_peer_is_unavailable() {
    let server = start_server(&["--no-watch"]).await.expect("server starts");

    let (status, body) = post_eval(&server, "1+1").await;
    assert_eq!(status, 503);
    assert!(body["error"].is_string());

    server.stop().await;
}

#[tokio::test]
async fn test_eval_roundtrip_through_peer() {
    let server = start_server(&["--no-watch", "--keepalive-secs", "0"])
        .await
        .expect("server starts");
    let mut peer = server.connect_peer().await;

    let pending = {
        let url = server.http("/eval");
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .body("1+1")
                .send()
                .await
                .unwrap()
        })
    };

    let request = next_envelope(&mut peer).await;
    assert_eq!(request["message_type"], "eval");
    assert_eq!(request["code"], "1+1");
    assert!(request["_id"].as_str().is_some_and(|id| !id.is_empty()));

    reply(&mut peer, &request, json!(2)).await;

    let response = pending.await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"result": 2}));

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_evals_answered_out_of_order() {
    let server = start_server(&["--no-watch", "--keepalive-secs", "0"])
        .await
        .expect("server starts");
    let mut peer = server.connect_peer().await;

    let mut calls = Vec::new();
    for code in ["first", "second"] {
        let url = server.http("/eval");
        calls.push(tokio::spawn(async move {
            let response = reqwest::Client::new()
                .post(url)
                .body(code)
                .send()
                .await
                .unwrap();
            response.json::<Value>().await.unwrap()
        }));
    }

    let a = next_envelope(&mut peer).await;
    let b = next_envelope(&mut peer).await;
    assert_ne!(a["_id"], b["_id"]);

    // Answer in reverse order; each reply carries its request's code back.
    reply(&mut peer, &b, b["code"].clone()).await;
    reply(&mut peer, &a, a["code"].clone()).await;

    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap()["result"].clone());
    }
    assert_eq!(results, vec![json!("first"), json!("second")]);

    server.stop().await;
}

#[tokio::test]
async fn test_unanswered_eval_times_out() {
    let server = start_server(&[
        "--no-watch",
        "--keepalive-secs",
        "0",
        "--eval-timeout-secs",
        "1",
    ])
    .await
    .expect("server starts");
    let mut peer = server.connect_peer().await;

    let (status, body) = post_eval(&server, "while(true){}").await;
    assert_eq!(status, 504);
    assert!(body["error"].is_string());

    // A late reply for the abandoned call is discarded; the session stays up.
    let request = next_envelope(&mut peer).await;
    reply(&mut peer, &request, json!(null)).await;
    assert!(wait_for_session(server.port, true, 2).await);

    server.stop().await;
}

#[tokio::test]
async fn test_peer_disconnect_fails_pending_eval() {
    let server = start_server(&["--no-watch", "--keepalive-secs", "0"])
        .await
        .expect("server starts");
    let mut peer = server.connect_peer().await;

    let pending = {
        let url = server.http("/eval");
        tokio::spawn(async move {
            let response = reqwest::Client::new()
                .post(url)
                .body("never answered")
                .send()
                .await
                .unwrap();
            response.status().as_u16()
        })
    };

    next_envelope(&mut peer).await;
    peer.close(None).await.unwrap();

    assert_eq!(pending.await.unwrap(), 500);
    assert!(wait_for_session(server.port, false, 5).await);

    server.stop().await;
}

#[tokio::test]
async fn test_keepalive_pings_are_sent() {
    let server = start_server(&["--no-watch", "--keepalive-secs", "1"])
        .await
        .expect("server starts");
    let mut peer = server.connect_peer().await;

    for _ in 0..2 {
        let ping = next_envelope(&mut peer).await;
        assert_eq!(ping["message_type"], "ping");
        reply(&mut peer, &ping, json!("pong")).await;
    }
    assert!(wait_for_session(server.port, true, 2).await);

    server.stop().await;
}

#[tokio::test]
async fn test_new_peer_replaces_old_one() {
    let server = start_server(&["--no-watch", "--keepalive-secs", "0"])
        .await
        .expect("server starts");
    let mut old_peer = server.connect_peer().await;
    let mut new_peer = server.connect_peer().await;

    // The replaced connection is closed by the server.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match old_peer.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old peer should be disconnected");

    let pending = {
        let url = server.http("/eval");
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .body("location.href")
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        })
    };
    let request = next_envelope(&mut new_peer).await;
    reply(&mut new_peer, &request, json!("about:blank")).await;
    assert_eq!(pending.await.unwrap()["result"], "about:blank");

    server.stop().await;
}

#[tokio::test]
async fn test_modified_file_is_evaluated() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("page.js");
    std::fs::write(&script, "initial()").unwrap();
    let pattern = dir.path().join("*.js").to_string_lossy().into_owned();

    let server = start_server(&[
        "--watch",
        &pattern,
        "--rescan-ms",
        "50",
        "--keepalive-secs",
        "0",
    ])
    .await
    .expect("server starts");
    let mut peer = server.connect_peer().await;

    // Keep writing until the watcher has picked the file up.
    let writer = tokio::spawn({
        let script = script.clone();
        async move {
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = tokio::fs::write(&script, "reloaded()").await;
            }
        }
    });

    // A read can race the truncating write, so wait for the full content.
    loop {
        let request = next_envelope(&mut peer).await;
        assert_eq!(request["message_type"], "eval");
        if request["code"] == "reloaded()" {
            break;
        }
    }

    writer.abort();
    server.stop().await;
}
