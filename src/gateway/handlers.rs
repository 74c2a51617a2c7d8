//! HTTP route dispatcher (spec.md §6.1), the same `match (Method, path
//! segments)` shape as the teacher's `http_api.rs::handle_request`,
//! generalized from a flat `/sandboxes` surface to ARL's nested
//! `/v1/sessions/*` and `/v1/pools/*` resources, and using ARL's flat
//! `{error, detail}` wire shape (`ArlError::to_response`) in place of the
//! teacher's `{success, data, error}` `ApiResponse<T>` wrapper.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::crd::{WarmPool, WarmPoolSpec};
use crate::error::{ArlError, ErrorResponse};
use crate::gateway::session::Session;
use crate::gateway::{execute, restore, shell, tools, trajectory, AppState};
use crate::pod_template;
use crate::types::{
    ExecuteRequest, PoolCreateRequest, PoolInfo, PoolPatchRequest, RestoreRequest, SessionCreateRequest,
};
use crate::validation;

pub(crate) type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

pub(crate) fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty() -> BoxBody {
    Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

pub(crate) fn error_response(status: StatusCode, kind: &str, detail: &str) -> Response<BoxBody> {
    json_response(
        status,
        &ErrorResponse {
            error: kind.to_string(),
            detail: Some(detail.to_string()),
        },
    )
}

fn arl_error_response(err: ArlError) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &err.to_response())
}

fn kube_unconfigured() -> Response<BoxBody> {
    arl_error_response(ArlError::Other(anyhow::anyhow!(
        "gateway has no kube client configured"
    )))
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_argument", "failed to read request body"))?
        .to_bytes();

    serde_json::from_slice(&body_bytes)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "invalid_argument", &format!("invalid JSON: {e}")))
}

/// Dispatch one HTTP request against the Gateway's route table.
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["healthz"]) => healthz(),
        (Method::GET, ["metrics"]) => metrics(&state).await,

        (Method::POST, ["v1", "sessions"]) => create_session(req, &state).await,
        (Method::GET, ["v1", "sessions", id]) => get_session(id, &state).await,
        (Method::DELETE, ["v1", "sessions", id]) => delete_session(id, &state).await,
        (Method::POST, ["v1", "sessions", id, "execute"]) => session_execute(req, id, &state).await,
        (Method::POST, ["v1", "sessions", id, "restore"]) => session_restore(req, id, &state).await,
        (Method::GET, ["v1", "sessions", id, "history"]) => session_history(id, &state).await,
        (Method::GET, ["v1", "sessions", id, "trajectory"]) => session_trajectory(id, &state).await,
        (Method::GET, ["v1", "sessions", id, "shell"]) => session_shell(req, id, &state).await,
        (Method::GET, ["v1", "sessions", id, "tools"]) => session_list_tools(id, &state).await,
        (Method::POST, ["v1", "sessions", id, "tools", tool_name]) => {
            session_call_tool(req, id, tool_name, &state).await
        }

        (Method::POST, ["v1", "pools"]) => create_pool(req, &state).await,
        (Method::GET, ["v1", "pools", name]) => get_pool(name, &query, &state).await,
        (Method::PATCH, ["v1", "pools", name]) => patch_pool(req, name, &query, &state).await,
        (Method::DELETE, ["v1", "pools", name]) => delete_pool(name, &query, &state).await,

        _ => error_response(StatusCode::NOT_FOUND, "not_found", "no such route"),
    };

    Ok(response)
}

fn healthz() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(full("ok"))
        .unwrap()
}

/// Hand-rolled Prometheus text exposition (spec.md §6.1); no metrics crate
/// carried for this, matching the teacher's own choice not to pull one in
/// for its `eprintln!`-based operational logging.
async fn metrics(state: &AppState) -> Response<BoxBody> {
    let sessions = state.sessions.len().await;
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    let body = format!(
        "# HELP arl_sessions_active Sessions currently tracked by the gateway.\n\
         # TYPE arl_sessions_active gauge\n\
         arl_sessions_active {sessions}\n\
         # HELP arl_gateway_uptime_seconds Seconds since the gateway process started.\n\
         # TYPE arl_gateway_uptime_seconds counter\n\
         arl_gateway_uptime_seconds {uptime}\n"
    );
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(full(body))
        .unwrap()
}

fn parse_session_id(id: &str) -> Result<Uuid, Response<BoxBody>> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_argument", "malformed session id"))
}

async fn create_session(req: Request<Incoming>, state: &AppState) -> Response<BoxBody> {
    let body: SessionCreateRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if let Err(e) = validation::validate_pool_name(&body.pool_ref) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_argument", &e);
    }
    if state.sessions.len().await >= state.config.gateway.max_sessions {
        return arl_error_response(ArlError::Transient("gateway is at max_sessions capacity".into()));
    }

    let namespace = body
        .namespace
        .unwrap_or_else(|| state.config.gateway.default_namespace.clone());
    let idle_timeout = body
        .idle_timeout_seconds
        .or(Some(state.config.gateway.default_idle_timeout_seconds));
    let ready_deadline = Duration::from_secs(state.config.gateway.sandbox_ready_timeout_seconds);

    let allocated = match state
        .provisioner
        .allocate(&body.pool_ref, &namespace, idle_timeout, body.max_lifetime_seconds, ready_deadline)
        .await
    {
        Ok(a) => a,
        Err(e) => return arl_error_response(e),
    };

    let session = Arc::new(Session::new(
        Uuid::new_v4(),
        body.pool_ref.clone(),
        namespace,
        idle_timeout,
        body.max_lifetime_seconds,
        body.max_history.or(state.config.gateway.max_history),
        allocated,
    ));
    let info = session.info().await;
    execute::audit_session_created(session.id, &session.pool_ref, &info.sandbox_name);
    state.sessions.insert(session).await;

    json_response(StatusCode::CREATED, &info)
}

async fn get_session(id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    match state.sessions.get(&uuid).await {
        Some(session) => json_response(StatusCode::OK, &session.info().await),
        None => error_response(StatusCode::NOT_FOUND, "not_found", "unknown session"),
    }
}

async fn delete_session(id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    let Some(session) = state.sessions.remove(&uuid).await else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown session");
    };
    let sandbox_name = session.sandbox_name().await;
    if let Err(e) = state.provisioner.release(&sandbox_name, &session.namespace).await {
        eprintln!("arl gateway: failed releasing sandbox for deleted session {uuid}: {e}");
    }
    audit::log_event(AuditEvent::SessionDeleted {
        session_id: uuid.to_string(),
        reason: "deleted_by_client".to_string(),
    });
    Response::builder().status(StatusCode::NO_CONTENT).body(empty()).unwrap()
}

async fn session_execute(req: Request<Incoming>, id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    let Some(session) = state.sessions.get(&uuid).await else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown session");
    };
    let body: ExecuteRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let sandbox_name = session.sandbox_name().await;
    if let Err(e) = state.provisioner.touch_activity(&sandbox_name, &session.namespace).await {
        eprintln!("arl gateway: touch_activity failed for session {uuid}: {e}");
    }

    let rpc_timeout = Duration::from_secs(state.config.sidecar.rpc_timeout_seconds);
    match execute::execute_steps(&session, body.steps, rpc_timeout).await {
        Ok(execute::ExecuteOutcome::Complete(resp)) => json_response(StatusCode::OK, &resp),
        Ok(execute::ExecuteOutcome::Partial { response, error }) => {
            let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
            json_response(status, &response)
        }
        Err(e) => arl_error_response(e),
    }
}

async fn session_restore(req: Request<Incoming>, id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    let Some(session) = state.sessions.get(&uuid).await else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown session");
    };
    let body: RestoreRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let rpc_timeout = Duration::from_secs(state.config.sidecar.rpc_timeout_seconds);
    let ready_deadline = Duration::from_secs(state.config.gateway.sandbox_ready_timeout_seconds);
    match restore::restore(&session, state.provisioner.as_ref(), &body.snapshot_id, rpc_timeout, ready_deadline).await {
        Ok(_) => Response::builder().status(StatusCode::NO_CONTENT).body(empty()).unwrap(),
        Err(e) => arl_error_response(e),
    }
}

async fn session_history(id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    match state.sessions.get(&uuid).await {
        Some(session) => json_response(StatusCode::OK, &session.history_snapshot().await),
        None => error_response(StatusCode::NOT_FOUND, "not_found", "unknown session"),
    }
}

async fn session_trajectory(id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    let Some(session) = state.sessions.get(&uuid).await else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown session");
    };
    let history = session.history_snapshot().await;
    let entries = trajectory::build_trajectory(uuid, &history);
    match trajectory::to_jsonl(&entries) {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body(full(text))
            .unwrap(),
        Err(e) => arl_error_response(ArlError::Other(e.into())),
    }
}

async fn session_shell(req: Request<Incoming>, id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    let Some(session) = state.sessions.get(&uuid).await else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown session");
    };
    if !shell::is_websocket_upgrade(&req) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_argument", "expected a WebSocket upgrade request");
    }
    shell::handle_shell_upgrade(req, session)
}

/// `GET /v1/sessions/{id}/tools` (spec.md §4.E.5): list the registry the
/// pool's tool-init container wrote.
async fn session_list_tools(id: &str, state: &AppState) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    let Some(session) = state.sessions.get(&uuid).await else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown session");
    };
    let rpc_timeout = Duration::from_secs(state.config.sidecar.rpc_timeout_seconds);
    match tools::list_tools(&session, rpc_timeout).await {
        Ok(registry) => json_response(StatusCode::OK, &registry),
        Err(e) => arl_error_response(e),
    }
}

/// `POST /v1/sessions/{id}/tools/{name}` (spec.md §4.E.5): invoke a
/// tool's entrypoint with the request body as its JSON parameters.
async fn session_call_tool(
    req: Request<Incoming>,
    id: &str,
    tool_name: &str,
    state: &AppState,
) -> Response<BoxBody> {
    let uuid = match parse_session_id(id) {
        Ok(u) => u,
        Err(r) => return r,
    };
    let Some(session) = state.sessions.get(&uuid).await else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown session");
    };
    let arguments: serde_json::Value = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let rpc_timeout = Duration::from_secs(state.config.sidecar.rpc_timeout_seconds);
    match tools::call_tool(&session, tool_name, &arguments, rpc_timeout).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(e) => arl_error_response(e),
    }
}

fn namespace_from_query(query: &str, state: &AppState) -> String {
    for pair in query.split('&') {
        if let Some(v) = pair.strip_prefix("namespace=") {
            if !v.is_empty() {
                return v.to_string();
            }
        }
    }
    state.config.gateway.default_namespace.clone()
}

fn to_pool_info(name: &str, namespace: &str, pool: &WarmPool) -> PoolInfo {
    let status = pool.status.clone().unwrap_or_default();
    PoolInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        replicas: pool.spec.replicas,
        ready_replicas: status.ready_replicas,
        allocated_replicas: status.allocated_replicas,
        conditions: status.conditions,
    }
}

async fn create_pool(req: Request<Incoming>, state: &AppState) -> Response<BoxBody> {
    let body: PoolCreateRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if let Err(e) = validation::validate_pool_name(&body.name) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_argument", &e);
    }
    let namespace = body
        .namespace
        .clone()
        .unwrap_or_else(|| state.config.gateway.default_namespace.clone());

    let spec = WarmPoolSpec {
        image: body.image.clone(),
        workspace_dir: body.workspace_dir.clone().unwrap_or_else(|| "/workspace".to_string()),
        replicas: body.replicas,
        resources: body.resources.clone().unwrap_or_default(),
        image_locality: Default::default(),
        tools: body.tools.clone(),
        max_surge: 1,
    };
    if let Err(e) = pod_template::validate_pool_spec(&spec) {
        return arl_error_response(e);
    }

    let Some(client) = state.kube_client.clone() else {
        return kube_unconfigured();
    };
    let pools: Api<WarmPool> = Api::namespaced(client, &namespace);
    let pool = WarmPool {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(body.name.clone()),
            namespace: Some(namespace.clone()),
            ..Default::default()
        },
        spec,
        status: None,
    };

    match pools.create(&PostParams::default(), &pool).await {
        Ok(_) => {
            audit::log_event(AuditEvent::PoolCreated {
                pool: body.name.clone(),
                namespace,
                image: body.image,
                replicas: body.replicas,
            });
            Response::builder().status(StatusCode::CREATED).body(empty()).unwrap()
        }
        Err(kube::Error::Api(err)) if err.code == 409 => {
            arl_error_response(ArlError::AlreadyExists(format!("pool '{}' already exists", body.name)))
        }
        Err(e) => arl_error_response(ArlError::Other(e.into())),
    }
}

async fn get_pool(name: &str, query: &str, state: &AppState) -> Response<BoxBody> {
    let namespace = namespace_from_query(query, state);
    let Some(client) = state.kube_client.clone() else {
        return kube_unconfigured();
    };
    let pools: Api<WarmPool> = Api::namespaced(client, &namespace);
    match pools.get(name).await {
        Ok(pool) => json_response(StatusCode::OK, &to_pool_info(name, &namespace, &pool)),
        Err(kube::Error::Api(err)) if err.code == 404 => error_response(StatusCode::NOT_FOUND, "not_found", "unknown pool"),
        Err(e) => arl_error_response(ArlError::Other(e.into())),
    }
}

async fn patch_pool(req: Request<Incoming>, name: &str, query: &str, state: &AppState) -> Response<BoxBody> {
    let body: PoolPatchRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if let Some(resources) = &body.resources {
        if let Err(e) = resources.validate() {
            return error_response(StatusCode::BAD_REQUEST, "invalid_argument", &e);
        }
    }
    let namespace = body.namespace.clone().unwrap_or_else(|| namespace_from_query(query, state));

    let Some(client) = state.kube_client.clone() else {
        return kube_unconfigured();
    };
    let pools: Api<WarmPool> = Api::namespaced(client, &namespace);

    let existing = match pools.get(name).await {
        Ok(p) => p,
        Err(kube::Error::Api(err)) if err.code == 404 => {
            return error_response(StatusCode::NOT_FOUND, "not_found", "unknown pool");
        }
        Err(e) => return arl_error_response(ArlError::Other(e.into())),
    };
    let from_replicas = existing.spec.replicas;

    let mut spec_patch = serde_json::Map::new();
    if let Some(replicas) = body.replicas {
        spec_patch.insert("replicas".to_string(), serde_json::json!(replicas));
    }
    if let Some(resources) = &body.resources {
        spec_patch.insert("resources".to_string(), serde_json::to_value(resources).unwrap());
    }
    let merge = serde_json::json!({ "spec": serde_json::Value::Object(spec_patch) });

    match pools.patch(name, &PatchParams::default(), &Patch::Merge(&merge)).await {
        Ok(updated) => {
            if let Some(to_replicas) = body.replicas {
                audit::log_event(AuditEvent::PoolScaled {
                    pool: name.to_string(),
                    namespace: namespace.clone(),
                    from_replicas,
                    to_replicas,
                });
            }
            json_response(StatusCode::OK, &to_pool_info(name, &namespace, &updated))
        }
        Err(kube::Error::Api(err)) if err.code == 404 => error_response(StatusCode::NOT_FOUND, "not_found", "unknown pool"),
        Err(e) => arl_error_response(ArlError::Other(e.into())),
    }
}

async fn delete_pool(name: &str, query: &str, state: &AppState) -> Response<BoxBody> {
    let namespace = namespace_from_query(query, state);
    let Some(client) = state.kube_client.clone() else {
        return kube_unconfigured();
    };
    let pools: Api<WarmPool> = Api::namespaced(client, &namespace);
    match pools.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            audit::log_event(AuditEvent::PoolDeleted {
                pool: name.to_string(),
                namespace,
            });
            Response::builder().status(StatusCode::NO_CONTENT).body(empty()).unwrap()
        }
        Err(kube::Error::Api(err)) if err.code == 404 => error_response(StatusCode::NOT_FOUND, "not_found", "unknown pool"),
        Err(e) => arl_error_response(ArlError::Other(e.into())),
    }
}
