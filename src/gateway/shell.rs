//! Interactive shell bridge (spec.md §4.E.6): upgrades a
//! `GET /v1/sessions/{id}/shell` request to a WebSocket and pumps
//! `ShellMessage` frames between it and the session's sidecar
//! `ShellChannel`.
//!
//! hyper carries no WebSocket support of its own, and the teacher never
//! needed one, so this module does the handshake by hand: compute
//! `Sec-WebSocket-Accept` via `tokio_tungstenite`'s own
//! `derive_accept_key` (already reachable through the existing
//! `tokio-tungstenite` dependency, so no new crate is added), wait for
//! hyper to hand back the raw upgraded connection, then wrap it as a
//! `WebSocketStream`. Once upgraded, two independent tasks fan the
//! connection out against the sidecar's `ShellChannel` (spec.md: "the
//! gateway MUST use non-blocking fan-out ... to avoid head-of-line
//! blocking") rather than a single task alternating between the two
//! directions.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::gateway::handlers::{empty, error_response, BoxBody};
use crate::gateway::session::Session;
use crate::types::ShellMessage;

fn header_eq_ignore_ascii_case(value: &HeaderValue, expected: &str) -> bool {
    value
        .to_str()
        .map(|v| v.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// Whether `req` carries the headers of a WebSocket upgrade request.
pub fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let headers = req.headers();
    let has_upgrade = headers
        .get(UPGRADE)
        .map(|v| header_eq_ignore_ascii_case(v, "websocket"))
        .unwrap_or(false);
    let has_connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    has_upgrade && has_connection && headers.contains_key("sec-websocket-key")
}

/// Complete the WebSocket handshake and spawn the bridge task. Returns
/// the `101 Switching Protocols` response hyper sends back to the
/// client; the actual byte-shuffling happens on the upgraded connection
/// once hyper hands it off, in a detached task.
pub fn handle_shell_upgrade(mut req: Request<Incoming>, session: Arc<Session>) -> Response<BoxBody> {
    let Some(key) = req.headers().get("sec-websocket-key").cloned() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_argument", "missing Sec-WebSocket-Key");
    };
    let Ok(key_str) = key.to_str() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_argument", "malformed Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key_str.as_bytes());

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                if let Err(e) = bridge(ws, session).await {
                    eprintln!("arl gateway: shell bridge ended with error: {e:#}");
                }
            }
            Err(e) => eprintln!("arl gateway: shell upgrade failed: {e}"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept)
        .body(empty())
        .unwrap()
}

/// Pump `ShellMessage` frames in both directions between `ws` and the
/// session's sidecar `ShellChannel`, as two independent tasks so a slow
/// reader on one side never stalls the other (spec.md §4.E.6).
async fn bridge<S>(ws: WebSocketStream<S>, session: Arc<Session>) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sidecar, workspace_dir) = session.with_state(|s| (s.sidecar.clone(), s.workspace_dir.clone())).await;
    let channel = sidecar.open_shell(&workspace_dir).await?;
    let mut to_sidecar = channel.to_sidecar;
    let mut from_sidecar = channel.from_sidecar;

    let (mut ws_tx, mut ws_rx) = ws.split();

    let inbound = async move {
        while let Some(frame) = ws_rx.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg {
                Message::Text(text) => {
                    let Ok(shell_msg) = serde_json::from_str::<ShellMessage>(&text) else {
                        continue;
                    };
                    if to_sidecar.send(shell_msg).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    let outbound = async move {
        while let Some(msg) = from_sidecar.recv().await {
            let is_exit = matches!(msg, ShellMessage::Exit { .. });
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if is_exit {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    };

    tokio::join!(inbound, outbound);
    Ok(())
}
