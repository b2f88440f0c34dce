//! The supervisor's verdict on a completed worker turn.

use std::ops::Deref;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Continue,
    Inject,
    Stop,
    Clear,
    Compact,
    Abort,
}

/// A command string guaranteed non-empty at construction. `inject` and the
/// `abort` cleanup command both carry one of these instead of a plain
/// `String` — Rust's enum can't attach a non-empty-string constraint at the
/// type level, so the newtype pushes the check as close to construction as
/// practical instead of leaving it to the Controller's decision-handling
/// table to discover at the point of use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonEmptyCommand(String);

impl NonEmptyCommand {
    pub fn new(command: impl Into<String>) -> Option<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            None
        } else {
            Some(Self(command))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for NonEmptyCommand {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub command: Option<NonEmptyCommand>,
    pub reason: String,
    pub confidence: f32,
}

impl Decision {
    pub fn continue_monitoring(reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            action: DecisionAction::Continue,
            command: None,
            reason: reason.into(),
            confidence,
        }
    }

    /// Panics if `command` is empty or whitespace-only — callers (the
    /// marker parser) only reach this constructor after checking for
    /// non-empty content, so an empty command here is a parser bug.
    pub fn inject(command: impl Into<String>, reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            action: DecisionAction::Inject,
            command: Some(NonEmptyCommand::new(command).expect("inject command must be non-empty")),
            reason: reason.into(),
            confidence,
        }
    }

    pub fn stop(reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            action: DecisionAction::Stop,
            command: None,
            reason: reason.into(),
            confidence,
        }
    }

    /// A `cleanup_command` that is empty or whitespace-only is treated as
    /// "no cleanup command", not an error — abort's cleanup is optional.
    pub fn abort(reason: impl Into<String>, cleanup_command: Option<String>, confidence: f32) -> Self {
        Self {
            action: DecisionAction::Abort,
            command: cleanup_command.and_then(NonEmptyCommand::new),
            reason: reason.into(),
            confidence,
        }
    }
}
