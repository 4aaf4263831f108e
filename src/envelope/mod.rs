//! Unified response envelope
//!
//! Every body that leaves the gateway conforms to the same shape:
//! `{"success": true, "data": ...}` or
//! `{"success": false, "error": {"code": ..., "message": ...}}`.
//! The backend services already speak this shape, so upstream bodies that
//! carry a `success` field are passed through verbatim instead of being
//! wrapped a second time.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error payload inside an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// The `{success, data|error}` wrapper used at every boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    /// Wrap a payload in a success envelope
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Build an error envelope with a stable machine-readable code
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A JSON body received from an upstream service, classified once at the
/// transport boundary so routing code can branch on a typed shape instead of
/// re-inspecting untyped data.
#[derive(Debug, Clone)]
pub enum UpstreamBody {
    /// Body already carries the `success` field; forwarded verbatim.
    Enveloped { success: bool, body: Value },
    /// Anything else; wrapped in a success envelope before leaving the gateway.
    Raw(Value),
}

impl UpstreamBody {
    pub fn classify(value: Value) -> Self {
        match value.get("success").and_then(Value::as_bool) {
            Some(success) => Self::Enveloped {
                success,
                body: value,
            },
            None => Self::Raw(value),
        }
    }

    /// The body as it should appear on the wire: enveloped bodies pass
    /// through unchanged, raw bodies get wrapped.
    pub fn into_wire(self) -> Value {
        match self {
            Self::Enveloped { body, .. } => body,
            Self::Raw(value) => Envelope::success(value).to_value(),
        }
    }

    /// Unwrap to the inner payload: the `data` field of a success envelope,
    /// the whole body otherwise.
    pub fn into_data(self) -> Value {
        match self {
            Self::Enveloped {
                success: true,
                mut body,
            } => body
                .as_object_mut()
                .and_then(|map| map.remove("data"))
                .unwrap_or(Value::Null),
            Self::Enveloped { body, .. } => body,
            Self::Raw(value) => value,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Enveloped { success: false, .. })
    }
}

/// Errors the gateway generates itself, as opposed to errors proxied through
/// from an upstream. Each variant maps to a stable envelope code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    InvalidToken(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) | GatewayError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::InvalidToken(_) => "invalid_token",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::ServiceUnavailable(_) => "service_unavailable",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let envelope = Envelope::error(self.code(), self.to_string());
        (self.status(), Json(envelope)).into_response()
    }
}
