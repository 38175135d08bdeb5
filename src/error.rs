use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The stable client-visible error kinds from the error handling design (§7).
///
/// Every fallible operation in the core returns `Result<T, JobservError>`.
/// Context lost in translation (e.g. from `anyhow`) is folded into
/// `Unexpected`, never allowed to escape a held lock.
#[derive(Debug, thiserror::Error)]
pub enum JobservError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("invalid credentials: {0}")]
    AuthInvalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl JobservError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(vec![msg.into()])
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AuthRequired(_) | Self::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// JSend: {status: success|fail|error, data|message} (§6.C).
impl IntoResponse for JobservError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if let Self::Unexpected(ref e) = self {
            log::error!("unexpected error: {e:?}");
        }
        let (status, body) = match self {
            Self::Validation(msgs) => ("fail", json!({ "messages": msgs })),
            Self::Unexpected(_) => ("error", json!({ "message": "internal error" })),
            other => ("fail", json!({ "message": other.to_string() })),
        };
        (code, Json(json!({ "status": status, "data": body }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, JobservError>;

/// Retry transient storage/SMTP failures with exponential back-off, per §7
/// ("Unavailable ... up to 3-8 retries and exponential back-off").
pub async fn retry_unavailable<F, Fut, T>(max_attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(JobservError::Unavailable(msg)) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(JobservError::Unavailable(msg));
                }
                let backoff = std::time::Duration::from_millis(100 * 2u64.pow(attempt));
                log::warn!("retrying after transient failure ({attempt}/{max_attempts}): {msg}");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
