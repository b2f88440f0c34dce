//! End-to-end scenarios against an in-process HTTP surface with a scripted
//! Dispatcher and a recording Injector standing in for the worker PTY — no
//! real process or terminal is spawned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::{Mutex, RwLock};
use tower::ServiceExt;

use loopwright_lib::bus::Broadcaster;
use loopwright_lib::hooks::controller::{Controller, Injector};
use loopwright_lib::hooks::ingress::{build_hooks_router, ControllerSlot, HooksState, SupervisorStopRegistry};
use loopwright_lib::pty::PtyError;
use loopwright_lib::rest::{build_rest_router, RestState};
use loopwright_lib::supervisor::{Cooldown, Decision, DecisionContext, Dispatcher, SupervisorRuntime};

struct RecordingInjector {
    received: Mutex<Vec<String>>,
}

impl RecordingInjector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Injector for RecordingInjector {
    async fn inject(&self, command: &str) -> Result<(), PtyError> {
        self.received.lock().await.push(command.to_string());
        Ok(())
    }
}

/// Replays a fixed script of results, one per call; the last entry repeats
/// once the script is exhausted.
struct ScriptedDispatcher {
    script: Vec<Result<Decision, String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedDispatcher {
    fn new(script: Vec<Result<Decision, String>>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(script: Vec<Result<Decision, String>>, delay: Duration) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        let last = self.script.len() - 1;
        self.script[idx.min(last)].clone()
    }
}

fn stop_body(session_id: &str) -> Body {
    Body::from(
        serde_json::json!({
            "session_id": session_id,
            "transcript_path": "/tmp/does-not-exist.jsonl",
        })
        .to_string(),
    )
}

fn build_app(
    dispatcher: Box<dyn Dispatcher>,
    max_iterations: u32,
    failure_threshold: u32,
    injector: Arc<RecordingInjector>,
) -> (axum::Router, Arc<Controller>, Arc<Broadcaster>) {
    let broadcaster = Arc::new(Broadcaster::new());
    let runtime = SupervisorRuntime::new(dispatcher, max_iterations, failure_threshold);
    let cooldown = Cooldown::new(Duration::from_millis(0));
    let controller = Arc::new(Controller::new(runtime, cooldown, injector, broadcaster.clone(), 50));

    let controller_slot: ControllerSlot = Arc::new(RwLock::new(Some(controller.clone())));
    let hooks_state = HooksState {
        controller: controller_slot.clone(),
        supervisor_stop: Arc::new(SupervisorStopRegistry::new()),
        broadcaster: broadcaster.clone(),
    };
    let rest_state = RestState {
        controller: controller_slot,
        broadcaster: broadcaster.clone(),
    };
    let router = build_hooks_router(hooks_state).merge(build_rest_router(rest_state));
    (router, controller, broadcaster)
}

/// Scenario A: a single Stop answered with `[COMPLETE]` stops the Controller
/// after exactly one supervisor call and zero injections.
#[tokio::test]
async fn scenario_a_complete_on_first_stop() {
    let injector = RecordingInjector::new();
    let dispatcher = ScriptedDispatcher::new(vec![Ok(Decision::stop("done", 1.0))]);
    let (router, controller, _bus) = build_app(Box::new(dispatcher), 5, 3, injector.clone());

    controller.start("build X").await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/hooks/stop")
                .header("content-type", "application/json")
                .body(stop_body("s1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        controller.state().await,
        loopwright_lib::hooks::controller::ControllerState::Stopped
    );
    assert!(injector.received.lock().await.is_empty());
    assert_eq!(
        controller.stats_snapshot().await["supervisorCalls"],
        1
    );
}

/// Scenario B: `[CONTINUE] write tests` injects that literal command, then a
/// second Stop answered with `[COMPLETE]` stops the Controller. Two
/// supervisor calls, one injection.
#[tokio::test]
async fn scenario_b_continue_then_complete_injects_once() {
    let injector = RecordingInjector::new();
    let dispatcher = ScriptedDispatcher::new(vec![
        Ok(Decision::inject("write tests", "keep going", 0.9)),
        Ok(Decision::stop("ok", 1.0)),
    ]);
    let (router, controller, _bus) = build_app(Box::new(dispatcher), 5, 3, injector.clone());

    controller.start("build X").await;

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/hooks/stop")
                    .header("content-type", "application/json")
                    .body(stop_body("s1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(injector.received.lock().await.as_slice(), ["write tests"]);
    assert_eq!(
        controller.stats_snapshot().await["supervisorCalls"],
        2
    );
    assert_eq!(
        controller.state().await,
        loopwright_lib::hooks::controller::ControllerState::Stopped
    );
}

/// Scenario D: three consecutive dispatcher failures produce an abort whose
/// reason names the failure count, with the budget's `/clear` cleanup
/// command injected before the Controller stops.
#[tokio::test]
async fn scenario_d_three_consecutive_failures_abort() {
    let injector = RecordingInjector::new();
    let dispatcher = ScriptedDispatcher::new(vec![
        Err("supervisor crashed".to_string()),
        Err("supervisor crashed".to_string()),
        Err("supervisor crashed".to_string()),
    ]);
    let (router, controller, _bus) = build_app(Box::new(dispatcher), 50, 3, injector.clone());

    controller.start("build X").await;

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/hooks/stop")
                    .header("content-type", "application/json")
                    .body(stop_body("s1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(injector.received.lock().await.as_slice(), ["/clear"]);
    assert_eq!(
        controller.state().await,
        loopwright_lib::hooks::controller::ControllerState::Stopped
    );
}

/// Scenario E: with `max_iterations = 2`, the second turn hits the budget
/// before the dispatcher is ever invoked again.
#[tokio::test]
async fn scenario_e_iteration_budget_skips_second_dispatch() {
    let injector = RecordingInjector::new();
    let dispatcher = ScriptedDispatcher::new(vec![Ok(Decision::continue_monitoring("keep watching", 0.8))]);
    let (router, controller, _bus) = build_app(Box::new(dispatcher), 2, 3, injector.clone());

    controller.start("build X").await;

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/hooks/stop")
                    .header("content-type", "application/json")
                    .body(stop_body("s1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(injector.received.lock().await.as_slice(), ["/clear"]);
    assert_eq!(
        controller.state().await,
        loopwright_lib::hooks::controller::ControllerState::Stopped
    );
}

/// A Stop hook arriving while the Controller is mid-turn is dropped rather
/// than queued — the cooldown and single-supervisor-call-at-a-time
/// invariant from scenario C's first clause.
#[tokio::test]
async fn concurrent_stop_during_inflight_turn_is_dropped() {
    let injector = RecordingInjector::new();
    let dispatcher = ScriptedDispatcher::with_delay(
        vec![Ok(Decision::stop("done", 1.0))],
        Duration::from_millis(200),
    );
    let (router, controller, _bus) = build_app(Box::new(dispatcher), 5, 3, injector.clone());
    controller.start("build X").await;

    let first = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/hooks/stop")
                .header("content-type", "application/json")
                .body(stop_body("s1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/hooks/stop")
                .header("content-type", "application/json")
                .body(stop_body("s1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        controller.stats_snapshot().await["supervisorCalls"],
        1
    );
}

/// Same `/api/session` 503 contract as `session_endpoint_503s_without_controller`,
/// but driven over a real bound TCP listener and an actual HTTP client rather
/// than `tower::oneshot`, exercising the same `axum::serve` path the
/// lifecycle orchestrator runs in production.
#[tokio::test]
async fn session_endpoint_503s_over_real_http() {
    let broadcaster = Arc::new(Broadcaster::new());
    let controller_slot: ControllerSlot = Arc::new(RwLock::new(None));
    let hooks_state = HooksState {
        controller: controller_slot.clone(),
        supervisor_stop: Arc::new(SupervisorStopRegistry::new()),
        broadcaster: broadcaster.clone(),
    };
    let rest_state = RestState {
        controller: controller_slot,
        broadcaster,
    };
    let router = build_hooks_router(hooks_state).merge(build_rest_router(rest_state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let response = reqwest::get(format!("http://{addr}/api/session"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
}

/// `/api/session` reflects `stopped` once the controller has finished, and
/// 503s before any controller is installed.
#[tokio::test]
async fn session_endpoint_reports_final_state() {
    let injector = RecordingInjector::new();
    let dispatcher = ScriptedDispatcher::new(vec![Ok(Decision::stop("done", 1.0))]);
    let (router, controller, _bus) = build_app(Box::new(dispatcher), 5, 3, injector);
    controller.start("build X").await;

    let _ = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/hooks/stop")
                .header("content-type", "application/json")
                .body(stop_body("s1"))
                .unwrap(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
