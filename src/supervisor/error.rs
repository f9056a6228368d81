//! Supervisor error taxonomy. Every variant maps to an HTTP status so the
//! IPC handlers can return it directly.

use axum::http::StatusCode;

use super::state_machine::TransitionError;
use super::watcher::WatchError;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Process output closed before the readiness pattern matched")]
    StreamClosedWithoutMatch,

    #[error("Process exited unexpectedly ({0})")]
    ProcessExitedUnexpectedly(String),

    #[error("Install command '{command}' failed with exit code {code:?}")]
    InstallFailed { command: String, code: Option<i32> },

    #[error("App is not running")]
    NotRunning,

    #[error("App is already running")]
    AlreadyRunning,

    #[error("Readiness wait was cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<WatchError> for SupervisorError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::StreamClosedWithoutMatch => Self::StreamClosedWithoutMatch,
            WatchError::Cancelled => Self::Cancelled,
        }
    }
}

impl SupervisorError {
    pub fn spawn(command: &str, source: std::io::Error) -> Self {
        Self::Spawn {
            command: command.to_string(),
            source,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidTransition(_) | Self::AlreadyRunning | Self::NotRunning => {
                StatusCode::CONFLICT
            }
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::StreamClosedWithoutMatch
            | Self::ProcessExitedUnexpectedly(_)
            | Self::InstallFailed { .. }
            | Self::Spawn { .. } => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "SPAWN_ERROR",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::StreamClosedWithoutMatch => "STREAM_CLOSED_WITHOUT_MATCH",
            Self::ProcessExitedUnexpectedly(_) => "PROCESS_EXITED_UNEXPECTEDLY",
            Self::InstallFailed { .. } => "INSTALL_FAILED",
            Self::NotRunning => "NOT_RUNNING",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::Cancelled => "CANCELLED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state_machine::{EffectiveState, LifecycleEvent};

    #[test]
    fn transition_errors_are_conflicts() {
        let err: SupervisorError = TransitionError::InvalidTransition {
            from: EffectiveState::NotInstalled,
            event: LifecycleEvent::LaunchStarted,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
    }

    #[test]
    fn watch_errors_convert() {
        let err: SupervisorError = WatchError::StreamClosedWithoutMatch.into();
        assert!(matches!(err, SupervisorError::StreamClosedWithoutMatch));
        let json = err.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "STREAM_CLOSED_WITHOUT_MATCH");
    }

    #[test]
    fn spawn_error_mentions_command() {
        let err = SupervisorError::spawn(
            "missing-binary",
            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        );
        assert!(err.to_string().contains("missing-binary"));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
