//! End-to-end Gateway tests driven over real HTTP (spec.md §8's S1, S2,
//! S3, S6 scenarios), exercising `gateway::run_server` against a live
//! `TcpListener` with `FakeSandboxProvisioner` standing in for a real
//! cluster + sidecar. No Kubernetes client is configured, so pool CRUD
//! routes are untouched here; see the in-module tests for those.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use arl::config::Config;
use arl::gateway::session::FakeSandboxProvisioner;
use arl::gateway::{run_idle_sweep, run_server, AppState};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpStream;

async fn spawn_gateway(config: Config) -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    drop(listener);

    let state = Arc::new(AppState::new(Arc::new(FakeSandboxProvisioner::new()), None, config));
    tokio::spawn(run_server(addr, state.clone()));
    tokio::spawn(run_idle_sweep(state, Duration::from_millis(150)));
    // give the listener a moment to bind before the first request lands.
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

async fn send(addr: SocketAddr, req: Request<Full<Bytes>>) -> (StatusCode, Value) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let io = TokioIo::new(stream);
    let (mut sender, conn) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp: Response<Incoming> = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post(addr: SocketAddr, path: &str, body: Value) -> Request<Full<Bytes>> {
    Request::builder()
        .method("POST")
        .uri(format!("http://{addr}{path}"))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn get(addr: SocketAddr, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(format!("http://{addr}{path}"))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn delete(addr: SocketAddr, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("DELETE")
        .uri(format!("http://{addr}{path}"))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn create_session(addr: SocketAddr) -> Value {
    let (status, body) = send(addr, post(addr, "/v1/sessions", json!({"poolRef": "p1"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn healthz_reports_ok() {
    let addr = spawn_gateway(Config::default()).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let io = TokioIo::new(stream);
    let (mut sender, conn) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let resp = sender.send_request(get(addr, "/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

/// S1 — basic execute: echo returns stdout, exit 0, and a non-empty
/// snapshot id.
#[tokio::test]
async fn s1_basic_execute() {
    let addr = spawn_gateway(Config::default()).await;
    let session = create_session(addr).await;
    let id = session["id"].as_str().unwrap();

    let (status, body) = send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "echo", "command": ["echo", "hi"]}]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let result = &body["results"][0];
    assert_eq!(result["output"]["stdout"], "hi\n");
    assert_eq!(result["output"]["exitCode"], 0);
    assert_ne!(result["snapshotId"], "");
}

/// S2 — state persistence: a later step in the same session observes the
/// workspace state produced by an earlier one.
#[tokio::test]
async fn s2_state_persists_within_a_session() {
    let addr = spawn_gateway(Config::default()).await;
    let session = create_session(addr).await;
    let id = session["id"].as_str().unwrap();

    let (status, _) = send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "w", "command": ["sh", "-c", "echo 1 > /workspace/a.txt"]}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "r", "command": ["cat", "/workspace/a.txt"]}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["output"]["stdout"], "1\n");
}

/// S3 — restore: overwrite a file, restore to the snapshot before the
/// overwrite, and observe the earlier content with a truncated history.
#[tokio::test]
async fn s3_restore_rewinds_workspace_and_history() {
    let addr = spawn_gateway(Config::default()).await;
    let session = create_session(addr).await;
    let id = session["id"].as_str().unwrap();

    let (_, w1) = send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "w1", "command": ["sh", "-c", "echo 1 > /workspace/a.txt"]}]}),
        ),
    )
    .await;
    let snap1 = w1["results"][0]["snapshotId"].as_str().unwrap().to_string();

    send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "w2", "command": ["sh", "-c", "echo 2 > /workspace/a.txt"]}]}),
        ),
    )
    .await;

    let (_, r1) = send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "r", "command": ["cat", "/workspace/a.txt"]}]}),
        ),
    )
    .await;
    assert_eq!(r1["results"][0]["output"]["stdout"], "2\n");

    let (status, _) = send(
        addr,
        post(addr, &format!("/v1/sessions/{id}/restore"), json!({"snapshotID": snap1})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, r2) = send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "r2", "command": ["cat", "/workspace/a.txt"]}]}),
        ),
    )
    .await;
    assert_eq!(r2["results"][0]["output"]["stdout"], "1\n");

    let (_, history) = send(addr, get(addr, &format!("/v1/sessions/{id}/history"))).await;
    // w1 replayed + the post-restore read = 2 entries.
    assert_eq!(history.as_array().unwrap().len(), 2);
}

/// Restore against a snapshot id that was never recorded is a 4xx with
/// error kind `snapshot_missing` (spec.md §7's *SnapshotMissing*).
#[tokio::test]
async fn restore_with_unknown_snapshot_is_rejected() {
    let addr = spawn_gateway(Config::default()).await;
    let session = create_session(addr).await;
    let id = session["id"].as_str().unwrap();

    let (status, body) = send(
        addr,
        post(addr, &format!("/v1/sessions/{id}/restore"), json!({"snapshotID": "nonexistent"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "snapshot_missing");
}

/// S6 — idle reaping: a session with a short idle timeout and no
/// activity is reaped by the background sweep and 404s thereafter.
#[tokio::test]
async fn s6_idle_session_is_reaped() {
    let addr = spawn_gateway(Config::default()).await;
    let (status, session) = send(
        addr,
        post(addr, "/v1/sessions", json!({"poolRef": "p1", "idleTimeoutSeconds": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = session["id"].as_str().unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let (status, _) = send(addr, get(addr, &format!("/v1/sessions/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_session_then_execute_is_not_found() {
    let addr = spawn_gateway(Config::default()).await;
    let session = create_session(addr).await;
    let id = session["id"].as_str().unwrap();

    let (status, _) = send(addr, delete(addr, &format!("/v1/sessions/{id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [{"name": "echo", "command": ["echo", "hi"]}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// `GET /v1/sessions/{id}/trajectory` returns JSONL, one line per
/// recorded step, matching L1's round-trip law at the wire level.
#[tokio::test]
async fn trajectory_is_one_json_object_per_line() {
    let addr = spawn_gateway(Config::default()).await;
    let session = create_session(addr).await;
    let id = session["id"].as_str().unwrap();

    send(
        addr,
        post(
            addr,
            &format!("/v1/sessions/{id}/execute"),
            json!({"steps": [
                {"name": "a", "command": ["echo", "1"]},
                {"name": "b", "command": ["echo", "2"]},
            ]}),
        ),
    )
    .await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let io = TokioIo::new(stream);
    let (mut sender, conn) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let resp = sender
        .send_request(get(addr, &format!("/v1/sessions/{id}/trajectory")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let parsed: Value = serde_json::from_str(line).unwrap();
        assert!(parsed["action"]["command"].is_array());
    }
}
