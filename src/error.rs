use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

/// Detail used whenever a backend failure carries nothing better to relay.
pub const SERVER_CONNECTION_ERROR: &str = "Relaygate: Server Connection Error";

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures along the routing and forwarding path.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("{detail}")]
    BackendHttp { status: StatusCode, detail: String },
    #[error("malformed backend body: {0}")]
    MalformedBody(String),
    #[error("Model not found")]
    ModelNotFound(String),
    #[error("OpenAI API was not found")]
    ConfigurationNotFound,
    #[error("backend index {index} out of range ({count} configured)")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Unauthorized(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BackendUnreachable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendHttp { status, .. } => *status,
            Self::MalformedBody(_) => StatusCode::BAD_GATEWAY,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::ConfigurationNotFound => StatusCode::UNAUTHORIZED,
            Self::IndexOutOfRange { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BackendUnreachable(_) => "backend_unreachable",
            Self::BackendHttp { .. } => "backend_error",
            Self::MalformedBody(_) => "malformed_backend_body",
            Self::ModelNotFound(_) => "model_not_found",
            Self::ConfigurationNotFound => "configuration_not_found",
            Self::IndexOutOfRange { .. } => "backend_index_out_of_range",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
        }
    }

    /// Builds the error for a non-2xx backend reply from its raw body.
    pub fn from_backend_body(status: StatusCode, body: &[u8]) -> Self {
        Self::BackendHttp {
            status,
            detail: external_error_detail(body),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let status = err.status();
        let code = err.code();
        let app = AppError::new(status, code, err.to_string());
        match err {
            GatewayError::BackendUnreachable(_)
            | GatewayError::BackendHttp { .. }
            | GatewayError::MalformedBody(_) => app.with_type("upstream_error"),
            GatewayError::Unauthorized(_) | GatewayError::ConfigurationNotFound => {
                app.with_type("authentication_error")
            }
            GatewayError::ModelNotFound(model) => app.with_param(format!("model:{model}")),
            _ => app,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        AppError::from(self).into_response()
    }
}

/// Extracts the backend's own `error` field, prefixed as externally sourced.
pub fn external_error_detail(body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return SERVER_CONNECTION_ERROR.to_string();
    };
    let Some(error) = value.get("error") else {
        return SERVER_CONNECTION_ERROR.to_string();
    };
    match error.get("message").and_then(|m| m.as_str()) {
        Some(message) => format!("External: {message}"),
        None => match error.as_str() {
            Some(text) => format!("External: {text}"),
            None => format!("External: {error}"),
        },
    }
}
