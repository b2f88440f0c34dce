//! Event-driven coordinator: on a worker completion signal, gathers
//! decision context and invokes the supervisor; translates its decision
//! into session-state transitions and (at most) one PTY write.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::bus::{EventKind, SharedBroadcaster};
use crate::hooks::events::{PostToolUseEvent, SessionEndEvent, SessionStartEvent, StopEvent};
use crate::pty::PtyError;
use crate::session::{SessionHandle, ToolHistoryRing};
use crate::supervisor::{Cooldown, Decision, DecisionAction, SupervisorRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Monitoring,
    Processing,
    CallingSupervisor,
    Injecting,
    Stopped,
}

/// Writes a command into the worker's PTY. Implemented by the lifecycle
/// orchestrator over the worker's [`crate::pty::PtyManager`]; kept as a
/// trait so the Controller never depends on the PTY Manager directly.
#[async_trait]
pub trait Injector: Send + Sync {
    async fn inject(&self, command: &str) -> Result<(), PtyError>;
}

struct ControllerInner {
    state: ControllerState,
    session: SessionHandle,
    history: ToolHistoryRing,
    session_id: Option<String>,
    transcript_path: Option<String>,
    task_description: String,
    paused: bool,
    stop_epoch: u64,
}

#[derive(Default)]
struct Stats {
    supervisor_calls: AtomicU32,
    injections: AtomicU32,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Mutex<ControllerInner>>,
    cooldown: Arc<Mutex<Cooldown>>,
    runtime: Arc<Mutex<SupervisorRuntime>>,
    injector: Arc<dyn Injector>,
    broadcaster: SharedBroadcaster,
    stats: Arc<Stats>,
}

impl Controller {
    pub fn new(
        runtime: SupervisorRuntime,
        cooldown: Cooldown,
        injector: Arc<dyn Injector>,
        broadcaster: SharedBroadcaster,
        tool_history_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControllerInner {
                state: ControllerState::Idle,
                session: SessionHandle::new(),
                history: ToolHistoryRing::new(tool_history_capacity),
                session_id: None,
                transcript_path: None,
                task_description: String::new(),
                paused: false,
                stop_epoch: 0,
            })),
            cooldown: Arc::new(Mutex::new(cooldown)),
            runtime: Arc::new(Mutex::new(runtime)),
            injector,
            broadcaster,
            stats: Arc::new(Stats::default()),
        }
    }

    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state
    }

    pub async fn session_snapshot(&self) -> (crate::session::SessionState, Option<u64>) {
        let inner = self.inner.lock().await;
        (inner.session.current().clone(), inner.session.runtime_ms())
    }

    pub async fn stats_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "supervisorCalls": self.stats.supervisor_calls.load(Ordering::Relaxed),
            "injections": self.stats.injections.load(Ordering::Relaxed),
        })
    }

    /// Assembles the `GET /api/session` payload (§6.4): session state plus
    /// derived runtime, and the Controller's own loop state and stats.
    pub async fn status_report(&self) -> serde_json::Value {
        let (tag, state_details, metadata, controller_state) = {
            let inner = self.inner.lock().await;
            let state_details = inner.session.current().clone();
            let tag = state_details.tag();
            let runtime_ms = inner.session.runtime_ms();
            let metadata = state_details.metadata().cloned().map(|m| (m, runtime_ms));
            (tag, state_details, metadata, inner.state)
        };

        let metadata_json = metadata.map(|(m, runtime_ms)| {
            let runtime_ms = runtime_ms.unwrap_or(0);
            serde_json::json!({
                "taskDescription": m.task_description,
                "startTime": m.start_time_iso,
                "runtime": runtime_ms,
                "runtimeFormatted": format_runtime(runtime_ms),
            })
        });

        serde_json::json!({
            "state": tag,
            "stateDetails": state_details,
            "metadata": metadata_json,
            "hooks": {
                "state": controller_state,
                "stats": self.stats_snapshot().await,
            }
        })
    }

    /// Legal from `idle` or `stopped`. Resets counters and history.
    pub async fn start(&self, task: impl Into<String>) {
        let task = task.into();
        let mut inner = self.inner.lock().await;
        inner.state = ControllerState::Monitoring;
        inner.history.clear();
        inner.task_description = task.clone();
        inner.session_id = None;
        inner.transcript_path = None;
        inner.paused = false;
        if let Err(e) = inner.session.start_task(task) {
            log::error!("session FSM: {e}");
            inner.session.set_error(e.to_string());
        }
        drop(inner);
        self.publish_session_state().await;
    }

    pub async fn on_session_start(&self, event: SessionStartEvent) {
        let mut inner = self.inner.lock().await;
        inner.session_id = Some(event.session_id.clone());
        drop(inner);
        self.broadcaster
            .publish(
                EventKind::HookEvent,
                serde_json::json!({"hook": "session_start", "session_id": event.session_id, "source": format!("{:?}", event.source)}),
            )
            .await;
    }

    pub async fn on_tool(&self, event: PostToolUseEvent) {
        let mut inner = self.inner.lock().await;
        inner.history.append(
            event.tool_name.clone(),
            event.tool_input.clone(),
            &event.tool_response.output,
            event.tool_response.error.clone(),
        );
        drop(inner);
        self.broadcaster
            .publish(
                EventKind::HookEvent,
                serde_json::json!({"hook": "tool", "tool_name": event.tool_name, "error": event.tool_response.error}),
            )
            .await;
    }

    pub async fn on_session_end(&self, event: SessionEndEvent) {
        self.broadcaster
            .publish(
                EventKind::HookEvent,
                serde_json::json!({"hook": "session_end", "reason": event.reason}),
            )
            .await;
        self.stop(format!("worker session ended: {}", event.reason)).await;
    }

    /// The completion signal. Dispatches asynchronously — callers (the
    /// hooks ingress handlers) must not await this before responding to the
    /// worker's HTTP request.
    pub async fn on_stop(self: &Arc<Self>, event: StopEvent) {
        let snapshot = {
            let mut inner = self.inner.lock().await;

            if inner.state != ControllerState::Monitoring {
                log::debug!(
                    "dropping Stop hook: controller is {:?}, not monitoring",
                    inner.state
                );
                return;
            }
            if inner.paused {
                log::debug!("Stop hook received while paused; not invoking supervisor");
                return;
            }

            inner.session_id = Some(event.session_id.clone());
            inner.transcript_path = Some(event.transcript_path.clone());
            inner.state = ControllerState::Processing;
            if let Err(e) = inner.session.begin_analysis() {
                log::warn!("session FSM: {e}");
            }

            let task_description = inner.task_description.clone();
            let transcript_path = inner.transcript_path.clone();
            let tool_history = inner.history.recent(10);
            let epoch = inner.stop_epoch;
            (task_description, transcript_path, tool_history, epoch)
        };

        self.broadcaster
            .publish(
                EventKind::HookEvent,
                serde_json::json!({"hook": "stop", "session_id": event.session_id}),
            )
            .await;

        let (task_description, transcript_path, tool_history, epoch) = snapshot;

        {
            let mut inner = self.inner.lock().await;
            inner.state = ControllerState::CallingSupervisor;
        }

        {
            let mut cooldown = self.cooldown.lock().await;
            if !cooldown.can_proceed() {
                let wait = cooldown.remaining();
                drop(cooldown);
                tokio::time::sleep(wait).await;
                cooldown = self.cooldown.lock().await;
            }
            cooldown.mark();
        }

        self.broadcaster
            .publish(
                EventKind::SupervisorCall,
                serde_json::json!({"task": task_description}),
            )
            .await;
        self.stats.supervisor_calls.fetch_add(1, Ordering::Relaxed);

        let decision = {
            let mut runtime = self.runtime.lock().await;
            runtime
                .run_turn(&task_description, transcript_path.as_deref(), &tool_history)
                .await
        };

        self.broadcaster
            .publish(
                EventKind::SupervisorDecision,
                serde_json::to_value(&decision).unwrap_or_default(),
            )
            .await;

        // `stop(reason)` races in-flight turns: if it fired while we were
        // awaiting the dispatcher, this turn's decision is discarded.
        let mut inner = self.inner.lock().await;
        if inner.state == ControllerState::Stopped || inner.stop_epoch != epoch {
            log::debug!("discarding supervisor decision: controller stopped mid-turn");
            return;
        }

        self.apply_decision(&mut inner, decision).await;
    }

    async fn apply_decision(&self, inner: &mut ControllerInner, decision: Decision) {
        match decision.action {
            DecisionAction::Inject => {
                let command = decision
                    .command
                    .clone()
                    .expect("inject decision missing command");
                self.do_inject(inner, &command).await;
            }
            DecisionAction::Continue => {
                // No specific instruction: clear context so the worker
                // doesn't accumulate unbounded history while idling.
                self.do_inject(inner, "/clear").await;
            }
            DecisionAction::Clear | DecisionAction::Compact => {
                inner.state = ControllerState::Monitoring;
            }
            DecisionAction::Stop => {
                inner.state = ControllerState::Stopped;
                if let Err(e) = inner.session.finish() {
                    log::warn!("session FSM: {e}");
                }
                log::info!("supervisor stop: {}", decision.reason);
            }
            DecisionAction::Abort => {
                if let Some(cleanup) = decision.command.clone() {
                    self.do_inject(inner, &cleanup).await;
                }
                inner.state = ControllerState::Stopped;
                if let Err(e) = inner.session.finish() {
                    log::warn!("session FSM: {e}");
                }
                log::warn!("supervisor abort: {}", decision.reason);
            }
        }
    }

    async fn do_inject(&self, inner: &mut ControllerInner, command: &str) {
        inner.state = ControllerState::Injecting;
        if let Err(e) = inner.session.begin_injection(command) {
            log::warn!("session FSM: {e}");
        }

        self.broadcaster
            .publish(EventKind::CommandInject, serde_json::json!({"command": command}))
            .await;

        match self.injector.inject(command).await {
            Ok(()) => {
                self.stats.injections.fetch_add(1, Ordering::Relaxed);
                inner.history.clear();
                if let Err(e) = inner.session.resume_running() {
                    log::warn!("session FSM: {e}");
                }
                inner.state = ControllerState::Monitoring;
            }
            Err(e) => {
                log::error!("failed to inject command: {e}");
                inner.session.set_error(e.to_string());
                inner.state = ControllerState::Stopped;
            }
        }
    }

    /// While paused, completion signals do not invoke the supervisor; tool
    /// history continues to accumulate. Idempotent.
    pub async fn pause(&self) {
        self.inner.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        self.inner.lock().await.paused = false;
    }

    /// Manual injection: bypasses the supervisor but still runs through the
    /// inject callback and event bus.
    pub async fn inject(&self, command: impl Into<String>) {
        let command = command.into();
        let mut inner = self.inner.lock().await;
        self.do_inject(&mut inner, &command).await;
    }

    pub async fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock().await;
        inner.stop_epoch += 1;
        inner.state = ControllerState::Stopped;
        if let Err(e) = inner.session.finish() {
            log::warn!("session FSM on stop: {e}");
        }
        drop(inner);
        self.broadcaster
            .publish(EventKind::SupervisorState, serde_json::json!({"stopped": true, "reason": reason}))
            .await;
    }

    async fn publish_session_state(&self) {
        let inner = self.inner.lock().await;
        let tag = inner.session.current().tag();
        drop(inner);
        self.broadcaster
            .publish(EventKind::SessionState, serde_json::json!({"state": tag}))
            .await;
    }
}

/// Formats a millisecond duration the way a human skimming `/api/session`
/// would want it: the coarsest two units, dropping leading zero units.
fn format_runtime(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
