//! Authenticated-by-locality HTTP endpoints that receive worker hook events
//! and hand them to the Controller. "Authenticated by locality" means the
//! server is bound to `127.0.0.1` only (enforced by the caller that builds
//! the `TcpListener`) — these handlers themselves do no auth.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::RwLock;

use crate::bus::{EventKind, SharedBroadcaster};
use crate::hooks::controller::Controller;
use crate::hooks::events::{
    HookResponse, PostToolUseEvent, SessionEndEvent, SessionStartEvent, StopEvent,
};
use crate::supervisor::SupervisorStopSlot;

/// Single-consumer registry for the decoupled interactive supervisor's own
/// Stop hook. Registering a new slot replaces any prior one — exactly one
/// consumer is ever live at a time. Carries the supervisor's own transcript
/// path through to that consumer, not just a bare wakeup.
pub struct SupervisorStopRegistry {
    slot: RwLock<Option<SupervisorStopSlot>>,
}

impl Default for SupervisorStopRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorStopRegistry {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    pub async fn register(&self, slot: SupervisorStopSlot) {
        *self.slot.write().await = Some(slot);
    }

    pub async fn fire(&self, transcript_path: String) {
        let consumer = self.slot.read().await.clone();
        match consumer {
            Some(slot) => slot.set(transcript_path).await,
            None => log::debug!("supervisor/stop received with no registered consumer"),
        }
    }
}

/// Slot the worker controller is installed into once startup completes.
/// Endpoints hit before that point answer 503, per the Hooks Ingress
/// contract, instead of panicking or queuing events for later.
pub type ControllerSlot = Arc<RwLock<Option<Arc<Controller>>>>;

#[derive(Clone)]
pub struct HooksState {
    pub controller: ControllerSlot,
    pub supervisor_stop: Arc<SupervisorStopRegistry>,
    pub broadcaster: SharedBroadcaster,
}

pub fn build_hooks_router(state: HooksState) -> Router {
    Router::new()
        .route("/api/hooks/session-start", post(handle_session_start))
        .route("/api/hooks/tool", post(handle_tool))
        .route("/api/hooks/stop", post(handle_stop))
        .route("/api/hooks/session-end", post(handle_session_end))
        .route("/api/supervisor/stop", post(handle_supervisor_stop))
        .with_state(state)
}

async fn controller_or_503(state: &HooksState) -> Result<Arc<Controller>, (StatusCode, Json<HookResponse>)> {
    match state.controller.read().await.clone() {
        Some(controller) => Ok(controller),
        None => Err((StatusCode::SERVICE_UNAVAILABLE, Json(HookResponse::not_initialised()))),
    }
}

/// A malformed body never reaches the Controller and never propagates as
/// an HTTP error to the worker — it is swallowed into a 200 with a warning
/// attached, per the HookMalformed row of the error taxonomy.
fn malformed_response(rejection: JsonRejection) -> (StatusCode, Json<HookResponse>) {
    log::warn!("malformed hook payload: {rejection}");
    (StatusCode::OK, Json(HookResponse::with_warning(rejection.to_string())))
}

async fn handle_session_start(
    State(state): State<HooksState>,
    body: Result<Json<SessionStartEvent>, JsonRejection>,
) -> (StatusCode, Json<HookResponse>) {
    let event = match body {
        Ok(Json(event)) => event,
        Err(e) => return malformed_response(e),
    };
    let controller = match controller_or_503(&state).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    controller.on_session_start(event).await;
    (StatusCode::OK, Json(HookResponse::ok()))
}

async fn handle_tool(
    State(state): State<HooksState>,
    body: Result<Json<PostToolUseEvent>, JsonRejection>,
) -> (StatusCode, Json<HookResponse>) {
    let event = match body {
        Ok(Json(event)) => event,
        Err(e) => return malformed_response(e),
    };
    let controller = match controller_or_503(&state).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    controller.on_tool(event).await;
    (StatusCode::OK, Json(HookResponse::ok()))
}

/// The completion signal. Dispatched via `tokio::spawn` rather than awaited
/// inline — the endpoint must not block on the supervisor turn it triggers.
async fn handle_stop(
    State(state): State<HooksState>,
    body: Result<Json<StopEvent>, JsonRejection>,
) -> (StatusCode, Json<HookResponse>) {
    let event = match body {
        Ok(Json(event)) => event,
        Err(e) => return malformed_response(e),
    };
    let controller = match controller_or_503(&state).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    tokio::spawn(async move {
        controller.on_stop(event).await;
    });
    (StatusCode::OK, Json(HookResponse::ok()))
}

async fn handle_session_end(
    State(state): State<HooksState>,
    body: Result<Json<SessionEndEvent>, JsonRejection>,
) -> (StatusCode, Json<HookResponse>) {
    let event = match body {
        Ok(Json(event)) => event,
        Err(e) => return malformed_response(e),
    };
    let controller = match controller_or_503(&state).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    controller.on_session_end(event).await;
    (StatusCode::OK, Json(HookResponse::ok()))
}

async fn handle_supervisor_stop(
    State(state): State<HooksState>,
    body: Result<Json<StopEvent>, JsonRejection>,
) -> (StatusCode, Json<HookResponse>) {
    let event = match body {
        Ok(Json(event)) => event,
        Err(e) => return malformed_response(e),
    };
    state.supervisor_stop.fire(event.transcript_path.clone()).await;
    state
        .broadcaster
        .publish(
            EventKind::HookEvent,
            serde_json::json!({"hook": "supervisor_stop", "session_id": event.session_id}),
        )
        .await;
    (StatusCode::OK, Json(HookResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Broadcaster;
    use crate::hooks::controller::Injector;
    use crate::pty::PtyError;
    use crate::supervisor::{Cooldown, MockDispatcher, SupervisorRuntime};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoopInjector;
    #[async_trait]
    impl Injector for NoopInjector {
        async fn inject(&self, _command: &str) -> Result<(), PtyError> {
            Ok(())
        }
    }

    fn make_state(with_controller: bool) -> HooksState {
        let broadcaster = Arc::new(Broadcaster::new());
        let controller_slot: ControllerSlot = Arc::new(RwLock::new(None));
        if with_controller {
            let runtime = SupervisorRuntime::new(Box::new(MockDispatcher), 50, 3);
            let cooldown = Cooldown::new(Duration::from_millis(0));
            let controller = Arc::new(Controller::new(
                runtime,
                cooldown,
                Arc::new(NoopInjector),
                broadcaster.clone(),
                50,
            ));
            controller_slot.try_write().unwrap().replace(controller);
        }
        HooksState {
            controller: controller_slot,
            supervisor_stop: Arc::new(SupervisorStopRegistry::new()),
            broadcaster,
        }
    }

    #[tokio::test]
    async fn returns_503_when_controller_uninitialised() {
        let state = make_state(false);
        let router = build_hooks_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/hooks/session-start")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"session_id": "s1", "cwd": "/tmp", "source": "startup"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_body_still_returns_200_continue_true() {
        let state = make_state(true);
        let router = build_hooks_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/hooks/tool")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn well_formed_session_start_returns_continue_true() {
        let state = make_state(true);
        let router = build_hooks_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/hooks/session-start")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"session_id": "s1", "cwd": "/tmp", "source": "startup"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn supervisor_stop_fires_registered_notify() {
        let state = make_state(true);
        let slot = SupervisorStopSlot::new();
        state.supervisor_stop.register(slot.clone()).await;
        let router = build_hooks_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/supervisor/stop")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"session_id": "s1", "transcript_path": "/tmp/t.jsonl"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::timeout(Duration::from_millis(100), slot.wait_for_next())
            .await
            .expect("notify should have fired");
        assert_eq!(
            slot.take_transcript_path().await.as_deref(),
            Some("/tmp/t.jsonl")
        );
    }
}
