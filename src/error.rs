use crate::course::ModuleStatus;
use crate::models::ValidationIssue;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;

/// A course engine action issued from a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("module {module_index} was already resolved as {status:?}")]
    NotPending { module_index: usize, status: ModuleStatus },
    #[error("retry requires a failed module, current status is {status:?}")]
    NotFailed { status: ModuleStatus },
    #[error("advance requires a passed module, current status is {status:?}")]
    NotPassed { status: ModuleStatus },
    #[error("course is already completed")]
    CourseCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("answered {answered} of {total} questions")]
    Incomplete { answered: usize, total: usize },
    #[error("attempt was already submitted")]
    AlreadySubmitted,
    #[error("attempt is disabled")]
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
}

impl From<ValidationIssue> for ErrorDetail {
    fn from(i: ValidationIssue) -> Self {
        Self {
            field: i.field,
            issue: i.issue,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
            request_id: request_id.into(),
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn unauthorized(request_id: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing caller identity", request_id)
    }

    pub fn forbidden(request_id: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", "access denied", request_id)
    }

    pub fn not_found(what: &str, request_id: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found"), request_id)
    }

    pub fn validation(message: impl Into<String>, issues: Vec<ValidationIssue>, request_id: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message, request_id)
            .with_details(issues.into_iter().map(ErrorDetail::from).collect())
    }

    pub fn transition(err: TransitionError, request_id: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "INVALID_TRANSITION", err.to_string(), request_id)
    }

    pub fn attempt(err: AttemptError, request_id: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string(), request_id)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
                request_id: self.request_id,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}
