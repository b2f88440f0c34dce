//! Wire schemas for inbound hook events POSTed by the worker (and, in
//! interactive-supervisor mode, by the supervisor's own hook configuration).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStartSource {
    Startup,
    Resume,
    Clear,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartEvent {
    pub session_id: String,
    pub cwd: String,
    pub source: SessionStartSource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolResponse {
    pub output: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostToolUseEvent {
    pub session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    pub tool_response: ToolResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopEvent {
    pub session_id: String,
    pub transcript_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionEndEvent {
    pub session_id: String,
    pub reason: String,
}

/// Every hook response is `{"continue": true}` (200), optionally with a
/// warning attached, except the controller-uninitialised case, which omits
/// `continue` entirely and carries only `{"error": ...}` (503).
#[derive(Debug, Clone, Serialize)]
pub struct HookResponse {
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookResponse {
    pub fn ok() -> Self {
        Self {
            continue_: Some(true),
            error: None,
        }
    }

    pub fn with_warning(message: impl Into<String>) -> Self {
        Self {
            continue_: Some(true),
            error: Some(message.into()),
        }
    }

    pub fn not_initialised() -> Self {
        Self {
            continue_: None,
            error: Some("not initialised".to_string()),
        }
    }
}
