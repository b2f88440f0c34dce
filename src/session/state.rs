//! Guarded finite-state machine for the worker's session lifecycle.
//!
//! Unlike a free-running status field, `transition` validates every edge
//! against a fixed table and fails loudly on anything not listed — the only
//! privileged escape hatch is `set_error`, which may fire from any tag.

use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTag {
    Idle,
    TaskRunning,
    Analyzing,
    Injecting,
    Error,
}

impl StateTag {
    fn legal_targets(self) -> &'static [StateTag] {
        use StateTag::*;
        match self {
            Idle => &[TaskRunning],
            TaskRunning => &[Analyzing, Idle],
            Analyzing => &[Injecting, Idle],
            Injecting => &[TaskRunning],
            Error => &[Idle],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub task_description: String,
    #[serde(skip)]
    pub start: Instant,
    pub start_time_iso: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    TaskRunning { metadata: SessionMetadata },
    Analyzing { metadata: SessionMetadata },
    Injecting { metadata: SessionMetadata, command: String },
    Error { message: String, previous: StateTag },
}

impl SessionState {
    pub fn tag(&self) -> StateTag {
        match self {
            SessionState::Idle => StateTag::Idle,
            SessionState::TaskRunning { .. } => StateTag::TaskRunning,
            SessionState::Analyzing { .. } => StateTag::Analyzing,
            SessionState::Injecting { .. } => StateTag::Injecting,
            SessionState::Error { .. } => StateTag::Error,
        }
    }

    pub fn metadata(&self) -> Option<&SessionMetadata> {
        match self {
            SessionState::TaskRunning { metadata }
            | SessionState::Analyzing { metadata }
            | SessionState::Injecting { metadata, .. } => Some(metadata),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid session transition {from:?} -> {to:?} (allowed: {allowed:?})")]
pub struct InvalidTransition {
    pub from: StateTag,
    pub to: StateTag,
    pub allowed: &'static [StateTag],
}

/// Owns the single worker session's state for the run's lifetime.
pub struct SessionHandle {
    state: SessionState,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn current(&self) -> &SessionState {
        &self.state
    }

    pub fn runtime_ms(&self) -> Option<u64> {
        self.state
            .metadata()
            .map(|m| m.start.elapsed().as_millis() as u64)
    }

    /// Starts a task: legal only from `Idle` or `Error`-via-reset (callers
    /// must `reset()` out of `Error` before starting a new task).
    pub fn start_task(&mut self, task_description: impl Into<String>) -> Result<(), InvalidTransition> {
        self.guarded_set(StateTag::TaskRunning, || SessionState::TaskRunning {
            metadata: SessionMetadata {
                task_description: task_description.into(),
                start: Instant::now(),
                start_time_iso: chrono::Utc::now().to_rfc3339(),
            },
        })
    }

    pub fn begin_analysis(&mut self) -> Result<(), InvalidTransition> {
        let metadata = self
            .state
            .metadata()
            .cloned()
            .ok_or_else(|| InvalidTransition {
                from: self.state.tag(),
                to: StateTag::Analyzing,
                allowed: self.state.tag().legal_targets(),
            })?;
        self.guarded_set(StateTag::Analyzing, move || SessionState::Analyzing {
            metadata,
        })
    }

    pub fn begin_injection(&mut self, command: impl Into<String>) -> Result<(), InvalidTransition> {
        let metadata = self
            .state
            .metadata()
            .cloned()
            .ok_or_else(|| InvalidTransition {
                from: self.state.tag(),
                to: StateTag::Injecting,
                allowed: self.state.tag().legal_targets(),
            })?;
        let command = command.into();
        self.guarded_set(StateTag::Injecting, move || SessionState::Injecting {
            metadata,
            command,
        })
    }

    /// Injection committed; the worker resumes running.
    pub fn resume_running(&mut self) -> Result<(), InvalidTransition> {
        let metadata = self
            .state
            .metadata()
            .cloned()
            .ok_or_else(|| InvalidTransition {
                from: self.state.tag(),
                to: StateTag::TaskRunning,
                allowed: self.state.tag().legal_targets(),
            })?;
        self.guarded_set(StateTag::TaskRunning, move || SessionState::TaskRunning {
            metadata,
        })
    }

    pub fn finish(&mut self) -> Result<(), InvalidTransition> {
        self.guarded_set(StateTag::Idle, || SessionState::Idle)
    }

    /// Privileged: may be called from any tag, bypassing the transition
    /// table. Records the tag we were leaving for post-mortem logging.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let previous = self.state.tag();
        self.state = SessionState::Error {
            message: message.into(),
            previous,
        };
    }

    /// Explicit recovery path out of `Error`, the only edge `Error` allows.
    pub fn reset(&mut self) -> Result<(), InvalidTransition> {
        self.guarded_set(StateTag::Idle, || SessionState::Idle)
    }

    fn guarded_set(
        &mut self,
        to: StateTag,
        build: impl FnOnce() -> SessionState,
    ) -> Result<(), InvalidTransition> {
        let from = self.state.tag();
        let allowed = from.legal_targets();
        if !allowed.contains(&to) {
            return Err(InvalidTransition { from, to, allowed });
        }
        self.state = build();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_lifecycle_succeeds() {
        let mut session = SessionHandle::new();
        session.start_task("build feature X").unwrap();
        assert_eq!(session.current().tag(), StateTag::TaskRunning);
        session.begin_analysis().unwrap();
        session.begin_injection("do the thing").unwrap();
        session.resume_running().unwrap();
        assert_eq!(session.current().tag(), StateTag::TaskRunning);
        session.begin_analysis().unwrap();
        session.finish().unwrap();
        assert_eq!(session.current().tag(), StateTag::Idle);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut session = SessionHandle::new();
        // Idle -> Analyzing is not in the table.
        let err = session.begin_analysis().unwrap_err();
        assert_eq!(err.from, StateTag::Idle);
        assert_eq!(err.to, StateTag::Analyzing);
    }

    #[test]
    fn error_is_reachable_from_any_tag_and_only_resets_to_idle() {
        let mut session = SessionHandle::new();
        session.start_task("t").unwrap();
        session.set_error("boom");
        assert_eq!(session.current().tag(), StateTag::Error);
        match session.current() {
            SessionState::Error { previous, .. } => assert_eq!(*previous, StateTag::TaskRunning),
            _ => panic!("expected error state"),
        }
        session.reset().unwrap();
        assert_eq!(session.current().tag(), StateTag::Idle);
    }

    #[test]
    fn injecting_without_metadata_fails() {
        let mut session = SessionHandle::new();
        let err = session.begin_injection("x").unwrap_err();
        assert_eq!(err.from, StateTag::Idle);
    }
}
