use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sundial_core::{Error as CoreError, RateLimitExceeded};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing x-user-id header")]
    MissingUserId,

    #[error("invalid x-user-id header: {0}")]
    InvalidUserId(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    RateLimited(RateLimitExceeded),

    #[error("{0}")]
    Core(CoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::RateLimited(r) => ApiError::RateLimited(r),
            other => ApiError::Core(other),
        }
    }
}

impl From<RateLimitExceeded> for ApiError {
    fn from(e: RateLimitExceeded) -> Self {
        ApiError::RateLimited(e)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingUserId | ApiError::InvalidUserId(_) | ApiError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Core(err) => match err {
                CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::Conflict(_) => StatusCode::CONFLICT,
                CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                CoreError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
                CoreError::Backend { .. } | CoreError::BackendMessage(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    /// Server-side failures keep their detail out of the response body.
    fn public_message(&self) -> String {
        match self {
            ApiError::Core(CoreError::Crypto(_)) => {
                "stored credential is unreadable; reconnect needed".to_string()
            }
            ApiError::Core(CoreError::Backend { .. } | CoreError::BackendMessage(_)) => {
                "storage backend error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let reset_at = match &self {
            ApiError::RateLimited(r) => Some(r.reset_at),
            _ => None,
        };
        let body = ErrorBody {
            error: self.public_message(),
            reset_at,
        };
        let mut resp = (code, Json(body)).into_response();
        if let ApiError::RateLimited(r) = &self {
            let secs = r.retry_after_secs(Utc::now());
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}
