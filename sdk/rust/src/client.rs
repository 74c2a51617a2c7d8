use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{error_from_status, Error, Result};
use crate::types::*;

const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Builder for constructing an [`Arl`] client.
pub struct ArlBuilder {
    base_url: String,
    timeout: Duration,
}

impl ArlBuilder {
    /// Set the Gateway's base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<Arl> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("arl-rust-sdk/{SDK_VERSION}")).unwrap(),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(self.timeout)
            .build()?;

        Ok(Arl {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

/// Client for the ARL Gateway's HTTP API (spec.md §6.1).
///
/// # Example
/// ```no_run
/// # async fn example() -> arl_sdk::Result<()> {
/// let client = arl_sdk::Arl::builder().build()?;
/// let session = client.create_session("base-pool", Default::default()).await?;
/// let result = client.execute(session.id, &[arl_sdk::StepRequest::new("echo", &["echo", "hi"])]).await?;
/// println!("{:?}", result.results);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Arl {
    base_url: String,
    http: reqwest::Client,
}

impl Arl {
    /// Create a new builder with defaults resolved from the `ARL_BASE_URL`
    /// environment variable (spec.md §6.3).
    pub fn builder() -> ArlBuilder {
        ArlBuilder {
            base_url: std::env::var("ARL_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Health check. Returns `"ok"`.
    pub async fn health(&self) -> Result<String> {
        let url = format!("{}/healthz", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        if status >= 400 {
            return Err(error_from_status(status, &text));
        }
        Ok(text)
    }

    /// Create a new session against a WarmPool.
    pub async fn create_session(&self, pool_ref: &str, opts: SessionOptions) -> Result<SessionInfo> {
        let body = SessionCreateRequest {
            pool_ref: pool_ref.to_string(),
            namespace: opts.namespace,
            idle_timeout_seconds: opts.idle_timeout_seconds,
            max_lifetime_seconds: opts.max_lifetime_seconds,
        };
        self.request(reqwest::Method::POST, "/v1/sessions", Some(&body)).await
    }

    /// Fetch a session's current info.
    pub async fn get_session(&self, id: Uuid) -> Result<SessionInfo> {
        self.request(reqwest::Method::GET, &format!("/v1/sessions/{id}"), None::<&()>)
            .await
    }

    /// Delete a session, releasing its sandbox.
    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        self.request_no_content(reqwest::Method::DELETE, &format!("/v1/sessions/{id}"))
            .await
    }

    /// Execute a batch of steps against a session's sandbox.
    pub async fn execute(&self, id: Uuid, steps: &[StepRequest]) -> Result<ExecuteResponse> {
        let body = ExecuteRequest {
            steps: steps.to_vec(),
            trace_id: None,
        };
        self.request(reqwest::Method::POST, &format!("/v1/sessions/{id}/execute"), Some(&body))
            .await
    }

    /// Restore a session to a previously recorded snapshot.
    pub async fn restore(&self, id: Uuid, snapshot_id: &str) -> Result<()> {
        let body = RestoreRequest {
            snapshot_id: snapshot_id.to_string(),
        };
        self.request_no_content_with_body(reqwest::Method::POST, &format!("/v1/sessions/{id}/restore"), &body)
            .await
    }

    /// Fetch a session's full recorded step history.
    pub async fn history(&self, id: Uuid) -> Result<Vec<StepResult>> {
        self.request(reqwest::Method::GET, &format!("/v1/sessions/{id}/history"), None::<&()>)
            .await
    }

    /// Fetch a session's trajectory as JSONL text.
    pub async fn trajectory(&self, id: Uuid) -> Result<String> {
        let url = format!("{}/v1/sessions/{id}/trajectory", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        if status >= 400 {
            return Err(error_from_status(status, &text));
        }
        Ok(text)
    }

    /// Create a new WarmPool.
    pub async fn create_pool(
        &self,
        name: &str,
        namespace: Option<&str>,
        image: &str,
        replicas: u32,
    ) -> Result<()> {
        let body = PoolCreateRequest {
            name: name.to_string(),
            namespace: namespace.map(String::from),
            image: image.to_string(),
            replicas,
            resources: None,
            workspace_dir: None,
            tools: Vec::new(),
        };
        self.request_no_content_with_body(reqwest::Method::POST, "/v1/pools", &body)
            .await
    }

    /// Fetch a WarmPool's current status.
    pub async fn get_pool(&self, name: &str, namespace: &str) -> Result<PoolInfo> {
        self.request(
            reqwest::Method::GET,
            &format!("/v1/pools/{name}?namespace={namespace}"),
            None::<&()>,
        )
        .await
    }

    /// Scale a WarmPool's replica count.
    pub async fn scale_pool(&self, name: &str, namespace: &str, replicas: u32) -> Result<PoolInfo> {
        let body = PoolPatchRequest {
            replicas: Some(replicas),
            resources: None,
        };
        self.request(
            reqwest::Method::PATCH,
            &format!("/v1/pools/{name}?namespace={namespace}"),
            Some(&body),
        )
        .await
    }

    /// Delete a WarmPool.
    pub async fn delete_pool(&self, name: &str, namespace: &str) -> Result<()> {
        self.request_no_content(reqwest::Method::DELETE, &format!("/v1/pools/{name}?namespace={namespace}"))
            .await
    }

    /// Create a session and return a guard that deletes it on drop via
    /// `with_session`'s closure, guaranteeing cleanup even on error.
    pub async fn with_session<F, Fut, T>(&self, pool_ref: &str, opts: SessionOptions, f: F) -> Result<T>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let info = self.create_session(pool_ref, opts).await?;
        let handle = SessionHandle {
            id: info.id,
            client: self.clone(),
        };
        let result = f(handle).await;
        let _ = self.delete_session(info.id).await;
        result
    }

    // -- Internal --

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&(impl serde::Serialize + ?Sized)>,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.http.request(method, &url);
        if let Some(b) = body {
            req = req.header(CONTENT_TYPE, "application/json").json(b);
        }

        let response = req.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        if status >= 400 {
            return Err(error_from_status(status, &text));
        }

        Ok(serde_json::from_str(&text)?)
    }

    async fn request_no_content(&self, method: reqwest::Method, path: &str) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.request(method, &url).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            let text = response.text().await?;
            return Err(error_from_status(status, &text));
        }
        Ok(())
    }

    async fn request_no_content_with_body(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &(impl serde::Serialize + ?Sized),
    ) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .request(method, &url)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status >= 400 {
            let text = response.text().await?;
            return Err(error_from_status(status, &text));
        }
        Ok(())
    }
}

/// Handle to a session within a `with_session` closure.
///
/// Owns a clone of the client (cheap — `reqwest::Client` is `Arc`-backed).
pub struct SessionHandle {
    id: Uuid,
    client: Arl,
}

impl SessionHandle {
    /// The session's id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Execute a batch of steps in this session.
    pub async fn execute(&self, steps: &[StepRequest]) -> Result<ExecuteResponse> {
        self.client.execute(self.id, steps).await
    }

    /// Restore this session to a previously recorded snapshot.
    pub async fn restore(&self, snapshot_id: &str) -> Result<()> {
        self.client.restore(self.id, snapshot_id).await
    }

    /// Fetch this session's current info.
    pub async fn info(&self) -> Result<SessionInfo> {
        self.client.get_session(self.id).await
    }

    /// Fetch this session's full step history.
    pub async fn history(&self) -> Result<Vec<StepResult>> {
        self.client.history(self.id).await
    }
}
