//! Top-level error type for the binary boundary. Every subsystem error
//! converts into this via `#[from]`; `main.rs` matches on it once to pick
//! an exit code.

use thiserror::Error;

use crate::pty::PtyError;
use crate::session::InvalidTransition;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Session(#[from] InvalidTransition),

    #[error("failed to bind HTTP server on {addr}: {source}")]
    ServerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("startup error: {0}")]
    Startup(String),
}

impl AppError {
    /// Abnormal startup errors exit 1; everything else that reaches here
    /// before the worker PTY exists is equally a startup failure.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
