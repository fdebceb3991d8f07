use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::engine::EngineError;

use super::dto::{ReservationDto, reservation_list};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflicts: Option<Vec<ReservationDto>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_more: Option<bool>,
}

/// Error returned by every handler; renders as `{"error", "message", ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: code,
                message: message.into(),
                conflicts: None,
                has_more: None,
            },
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    /// Tenant lookup failed: a bad name is the caller's fault, anything else is ours.
    pub fn tenant(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::InvalidInput {
            Self::bad_request("InvalidTenant", e.to_string())
        } else {
            tracing::error!("tenant unavailable: {e}");
            Self::new(StatusCode::SERVICE_UNAVAILABLE, "StoreUnavailable", e.to_string())
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.error
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::InvalidRange { .. }
            | EngineError::InvalidQuantity { .. }
            | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::CapacityExceeded { .. }
            | EngineError::InvalidState { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::AlreadyExists(_) => StatusCode::CONFLICT,
            EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let mut err = Self::new(status, e.code(), e.to_string());
        if let EngineError::CapacityExceeded {
            conflicts, has_more, ..
        } = &e
        {
            err.body.conflicts = Some(reservation_list(conflicts));
            err.body.has_more = Some(*has_more);
        }
        err
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "InvalidBody", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request("InvalidQuery", rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request("InvalidPath", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.body.error, "{}", self.body.message);
        } else {
            tracing::debug!(code = self.body.error, "{}", self.body.message);
        }
        let retryable = self.status == StatusCode::SERVICE_UNAVAILABLE;
        let mut response = (self.status, Json(self.body)).into_response();
        if retryable {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
