use serde::Serialize;

/// Machine-readable discriminant for PTY failures, serialized alongside the
/// human-readable message so callers can match on `code` without parsing text.
#[derive(Debug, Clone, Serialize)]
pub enum PtyErrorCode {
    AlreadyRunning,
    NotRunning,
    SpawnFailed,
    WriteFailed,
    ResizeFailed,
    Closed,
}

#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{code:?}: {message}")]
pub struct PtyError {
    pub code: PtyErrorCode,
    pub message: String,
}

impl PtyError {
    pub fn already_running() -> Self {
        Self {
            code: PtyErrorCode::AlreadyRunning,
            message: "a worker is already running in this PTY".to_string(),
        }
    }

    pub fn not_running() -> Self {
        Self {
            code: PtyErrorCode::NotRunning,
            message: "no process is running in this PTY".to_string(),
        }
    }

    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::SpawnFailed,
            message: msg.into(),
        }
    }

    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::WriteFailed,
            message: msg.into(),
        }
    }

    pub fn resize_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::ResizeFailed,
            message: msg.into(),
        }
    }

    pub fn closed() -> Self {
        Self {
            code: PtyErrorCode::Closed,
            message: "PTY has been closed".to_string(),
        }
    }
}
