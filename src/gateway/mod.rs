//! The Gateway (spec.md §4.E): owns the in-memory session table and
//! exposes the HTTP/WebSocket surface of §6.1.
//!
//! Mirrors the teacher's split of `http_api.rs` into a thin `run_server`
//! entrypoint plus a dispatcher (`handlers.rs`) closing over shared
//! `AppState`, generalized from the teacher's empty `AppState {}` to one
//! that actually owns long-lived state: the session table and a
//! `kube::Client` for pool CRUD and sandbox provisioning.

pub mod execute;
pub mod handlers;
pub mod kube;
pub mod restore;
pub mod session;
pub mod shell;
pub mod tools;
pub mod trajectory;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::gateway::session::{SandboxProvisioner, SessionTable};

/// Shared state closed over by every request handler, mirroring the
/// teacher's `AppState` in `http_api.rs` but carrying the actual
/// long-lived collaborators the Gateway needs.
pub struct AppState {
    pub sessions: SessionTable,
    pub provisioner: Arc<dyn SandboxProvisioner>,
    pub kube_client: Option<::kube::Client>,
    pub config: Config,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        provisioner: Arc<dyn SandboxProvisioner>,
        kube_client: Option<::kube::Client>,
        config: Config,
    ) -> Self {
        Self {
            sessions: SessionTable::new(),
            provisioner,
            kube_client,
            config,
            started_at: chrono::Utc::now(),
        }
    }
}

/// Run the Gateway's HTTP/WebSocket server, the same `TcpListener` +
/// `hyper::server::conn::http1` + `service_fn` accept loop as
/// `http_api.rs::run_server`, generalized to upgrade connections to
/// WebSocket for the shell route.
pub async fn run_server(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    eprintln!("arl gateway listening on http://{addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handlers::handle_request(req, state)
            });

            let conn = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades();
            if let Err(err) = conn.await {
                eprintln!("arl gateway: error serving connection: {err:?}");
            }
        });
    }
}

/// Periodic idle/lifetime sweep over in-memory sessions, run alongside
/// `run_server` as its own tokio task — the Gateway's half of spec.md
/// §4.D's reaping (the Sandbox controller reaps the cluster object;
/// this drops the Gateway's own dangling `Session` entry if the
/// controller got there first, or a Sandbox was deleted out from under
/// a session out-of-band).
pub async fn run_idle_sweep(state: Arc<AppState>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        for id in state.sessions.ids().await {
            let Some(session) = state.sessions.get(&id).await else {
                continue;
            };
            if session.is_idle_expired(now).await || session.is_lifetime_expired(now) {
                let sandbox_name = session.sandbox_name().await;
                if let Err(e) = state.provisioner.release(&sandbox_name, &session.namespace).await {
                    eprintln!("arl gateway: failed to release expired session {id}: {e}");
                }
                state.sessions.remove(&id).await;
                crate::audit::log_event(crate::audit::AuditEvent::SessionDeleted {
                    session_id: id.to_string(),
                    reason: "idle_or_lifetime_expired".to_string(),
                });
            }
        }
    }
}
