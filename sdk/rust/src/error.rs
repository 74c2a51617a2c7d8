use crate::types::ErrorBody;

/// Errors returned by the ARL SDK, mirroring the Gateway's own error
/// taxonomy (`arl::error::ArlError`) on the client side.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 404 Not Found.
    #[error("not found: {0}")]
    NotFound(String),

    /// 409 Conflict / already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// 400 Bad Request.
    #[error("validation error: {0}")]
    Validation(String),

    /// 503/504: the gateway asked the client to retry, or a deadline elapsed.
    #[error("transient error, retry with backoff: {0}")]
    Transient(String),

    /// Any other 5xx.
    #[error("server error: {0}")]
    Server(String),

    /// Network / connection error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map an HTTP status + `{error, detail}` body to the appropriate error
/// variant, per spec.md §6.1's flat error wire shape.
pub fn error_from_status(status: u16, body: &str) -> Error {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| match &b.detail {
            Some(d) => format!("{}: {d}", b.error),
            None => b.error.clone(),
        })
        .unwrap_or_else(|| body.to_string());

    match status {
        400 => Error::Validation(message),
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        503 | 504 => Error::Transient(message),
        _ => Error::Server(message),
    }
}
