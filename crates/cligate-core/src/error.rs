use cligate_runtime::RuntimeError;
use cligate_wire::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { code: &'static str, message: String },

    #[error("session {0} not found")]
    NotFound(String),

    #[error("model {0} not found")]
    ModelNotFound(String),

    #[error("session {0} is already processing a request")]
    Conflict(String),

    #[error("maximum concurrent sessions ({limit}) reached")]
    Capacity { limit: usize },

    #[error("failed to start the CLI: {0}")]
    Startup(String),

    #[error("timed out waiting for CLI output")]
    StreamTimeout,

    #[error("CLI process failed{}", exit_code_suffix(.code))]
    ProcessFailure {
        code: Option<i32>,
        detail: Option<String>,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" with exit code {c}")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn invalid_request(code: &'static str, message: impl Into<String>) -> Self {
        GatewayError::InvalidRequest {
            code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest { .. } => 400,
            GatewayError::NotFound(_) | GatewayError::ModelNotFound(_) => 404,
            GatewayError::Conflict(_) => 409,
            GatewayError::Capacity { .. } | GatewayError::Startup(_) => 503,
            GatewayError::StreamTimeout => 504,
            GatewayError::ProcessFailure { .. } => 502,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request_error",
            GatewayError::NotFound(_) | GatewayError::ModelNotFound(_) => "not_found_error",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Capacity { .. } | GatewayError::Startup(_) => "service_unavailable",
            GatewayError::StreamTimeout => "timeout_error",
            GatewayError::ProcessFailure { .. } => "process_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { code, .. } => *code,
            GatewayError::NotFound(_) => "session_not_found",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::Conflict(_) => "session_busy",
            GatewayError::Capacity { .. } => "capacity_exceeded",
            GatewayError::Startup(_) => "claude_unavailable",
            GatewayError::StreamTimeout => "stream_timeout",
            GatewayError::ProcessFailure { .. } => "process_failed",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn to_wire(&self) -> WireError {
        let message = match self {
            GatewayError::ProcessFailure {
                detail: Some(detail),
                ..
            } => format!("{self}: {detail}"),
            // keep internals out of client-facing bodies
            GatewayError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        WireError::new(message, self.kind(), self.code())
    }
}

impl From<RuntimeError> for GatewayError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Capacity { limit } => GatewayError::Capacity { limit },
            RuntimeError::Conflict(session_id) => GatewayError::Conflict(session_id),
            RuntimeError::Startup { .. } => GatewayError::Startup(err.to_string()),
            other => GatewayError::Internal(anyhow::Error::new(other)),
        }
    }
}
