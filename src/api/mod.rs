//! HTTP management API
//!
//! Everything lives under `/api/firewall`. Mutating endpoints go through the
//! shared [`ChangeSession`]; read endpoints only look at the
//! [`StatusReporter`] snapshot and never take the session lock.

pub mod firewall;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::core::error::{Error, ErrorTranslation};
use crate::core::session::ChangeSession;
use crate::core::status::StatusReporter;

#[derive(Debug, Clone)]
pub struct ApiState {
    pub session: Arc<ChangeSession>,
    pub status: StatusReporter,
}

impl ApiState {
    pub fn new(session: Arc<ChangeSession>) -> Self {
        Self {
            status: session.reporter(),
            session,
        }
    }
}

/// Builds the complete router with request tracing.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .nest("/api/firewall", firewall::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body: `{ success: false, error, kind, suggestions }`
#[derive(Debug)]
pub enum ApiError {
    Engine(Error),
    BadRequest(String),
    NotFound(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<crate::core::error::CompileError> for ApiError {
    fn from(e: crate::core::error::CompileError) -> Self {
        ApiError::Engine(e.into())
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Engine(e) => match e {
                Error::Compile(_) => StatusCode::BAD_REQUEST,
                Error::Conflict(_) => StatusCode::CONFLICT,
                Error::NoPendingChange(_) => StatusCode::NOT_FOUND,
                Error::Apply(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Engine(e) => e.kind(),
        }
    }

    fn translation(&self) -> Option<ErrorTranslation> {
        match self {
            ApiError::Engine(Error::Apply(e)) => Some(e.translation()),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Engine(e) => write!(f, "{e}"),
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => f.write_str(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "Request failed: {self}");
        } else {
            tracing::debug!(kind = self.kind(), "Request rejected: {self}");
        }

        let translation = self.translation();
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
            "hint": translation.as_ref().map(|t| t.user_message.clone()),
            "suggestions": translation.map(|t| t.suggestions).unwrap_or_default(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
