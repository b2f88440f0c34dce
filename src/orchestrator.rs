//! Wires the PTY, Hooks Controller, Supervisor Dispatcher, and HTTP/WS
//! surfaces into one running process, then forwards the controlling
//! terminal to the worker until it exits or a signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};

use crate::bus::{Broadcaster, EventKind, SharedBroadcaster};
use crate::config::Config;
use crate::error::AppError;
use crate::hooks::controller::{Controller, Injector};
use crate::hooks::ingress::{build_hooks_router, ControllerSlot, HooksState, SupervisorStopRegistry};
use crate::pty::{PtyError, PtyManager};
use crate::rest::{build_rest_router, RestState};
use crate::supervisor::{
    Cooldown, Dispatcher, InteractiveDispatcher, MockDispatcher, PrintModeDispatcher,
    SupervisorRuntime, SupervisorStopSlot,
};

/// Bridges the Controller's [`Injector`] trait to the worker's own PTY.
/// A command is only written if the worker is still alive; a dead worker
/// makes injection a silent no-op rather than an error the Controller would
/// have to do anything special with.
struct PtyInjector {
    pty: PtyManager,
}

#[async_trait]
impl Injector for PtyInjector {
    async fn inject(&self, command: &str) -> Result<(), PtyError> {
        if !self.pty.is_running().await {
            log::warn!("inject requested but worker PTY is not running: {command:?}");
            return Ok(());
        }
        self.pty.write_line(command).await
    }
}

fn build_dispatcher(config: &Config, turn_complete: SupervisorStopSlot) -> Box<dyn Dispatcher> {
    if config.mock_supervisor {
        return Box::new(MockDispatcher);
    }

    if config.interactive_supervisor {
        let working_dir = config
            .worker_cwd
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        return Box::new(InteractiveDispatcher::new(
            config.agent_bin.clone(),
            working_dir,
            Duration::from_millis(config.supervisor_timeout_interactive_ms),
            turn_complete,
        ));
    }

    Box::new(PrintModeDispatcher::new(
        config.agent_bin.clone(),
        config.agent_print_flag.clone(),
        config.agent_bypass_flag.clone(),
        Duration::from_millis(config.supervisor_timeout_print_ms),
    ))
}

fn build_router(hooks_state: HooksState, rest_state: RestState) -> Router {
    build_hooks_router(hooks_state).merge(build_rest_router(rest_state))
}

/// Runs the full lifecycle: server, controller, worker PTY, signal handlers,
/// and stdin/resize forwarding. Returns the worker's exit code on a clean
/// worker exit, or an [`AppError`] for anything that goes wrong before the
/// worker is even running.
pub async fn run(config: Config) -> Result<i32, AppError> {
    let broadcaster: SharedBroadcaster = Arc::new(Broadcaster::new());

    let controller_slot: ControllerSlot = Arc::new(RwLock::new(None));
    let supervisor_stop = Arc::new(SupervisorStopRegistry::new());

    let hooks_state = HooksState {
        controller: controller_slot.clone(),
        supervisor_stop: supervisor_stop.clone(),
        broadcaster: broadcaster.clone(),
    };
    let rest_state = RestState {
        controller: controller_slot.clone(),
        broadcaster: broadcaster.clone(),
    };
    let router = build_router(hooks_state, rest_state);

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| AppError::ServerBind { addr: addr.clone(), source })?;
    log::info!("listening on http://{addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            log::error!("HTTP server exited: {e}");
        }
    });

    let worker_pty = PtyManager::new("worker");
    let injector: Arc<dyn Injector> = Arc::new(PtyInjector { pty: worker_pty.clone() });

    let turn_complete = SupervisorStopSlot::new();
    if config.interactive_supervisor {
        supervisor_stop.register(turn_complete.clone()).await;
    }

    let dispatcher = build_dispatcher(&config, turn_complete);
    let mut runtime = SupervisorRuntime::new(dispatcher, config.max_iterations, config.failure_threshold);

    let iteration_broadcaster = broadcaster.clone();
    runtime.on_iteration(Arc::new(move |progress| {
        let broadcaster = iteration_broadcaster.clone();
        let progress = serde_json::to_value(&progress).unwrap_or_default();
        tokio::spawn(async move {
            broadcaster.publish(EventKind::IterationUpdate, progress).await;
        });
    }));

    let cooldown = Cooldown::new(Duration::from_millis(config.cooldown_ms));
    let controller = Arc::new(Controller::new(
        runtime,
        cooldown,
        injector,
        broadcaster.clone(),
        config.tool_history_capacity,
    ));
    controller.start(config.task_description.clone()).await;
    controller_slot.write().await.replace(controller.clone());

    let on_bytes_broadcaster = broadcaster.clone();
    let on_bytes: crate::pty::OnBytes = Arc::new(move |text| {
        let broadcaster = on_bytes_broadcaster.clone();
        tokio::spawn(async move {
            broadcaster.publish_pty_output(&text).await;
        });
    });

    let exit_controller = controller.clone();
    let exit_signal = Arc::new(Notify::new());
    let exit_signal_setter = exit_signal.clone();
    let exit_code_slot: Arc<std::sync::Mutex<i32>> = Arc::new(std::sync::Mutex::new(0));
    let exit_code_slot_writer = exit_code_slot.clone();
    let on_exit: crate::pty::OnExit = Arc::new(move |status| {
        *exit_code_slot_writer.lock().unwrap() = status.code.unwrap_or(1);
        let controller = exit_controller.clone();
        let exit_signal = exit_signal_setter.clone();
        tokio::spawn(async move {
            controller.stop("worker exited").await;
            exit_signal.notify_one();
        });
    });

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let args: Vec<String> = Vec::new();
    let env = std::collections::HashMap::new();
    let worker_cwd = config.worker_cwd.as_ref().map(|p| p.to_string_lossy().into_owned());
    worker_pty
        .spawn(
            &config.agent_bin,
            &args,
            worker_cwd.as_deref(),
            &env,
            cols,
            rows,
            on_bytes,
            on_exit,
        )
        .await
        .map_err(AppError::from)?;

    let raw_mode_enabled = crossterm::terminal::enable_raw_mode().is_ok();

    let result = run_until_exit(worker_pty.clone(), controller.clone(), exit_signal).await;

    if raw_mode_enabled {
        let _ = crossterm::terminal::disable_raw_mode();
    }
    worker_pty.cleanup().await.map_err(AppError::from)?;

    match result {
        ShutdownCause::WorkerExited => Ok(*exit_code_slot.lock().unwrap()),
        ShutdownCause::Signal => Ok(0),
    }
}

enum ShutdownCause {
    WorkerExited,
    Signal,
}

/// Races stdin forwarding, window-resize forwarding, OS signal handlers, and
/// the worker-exit notification. The first one to fire wins and the others
/// are dropped — this task never runs more than one iteration of real work
/// after the race resolves.
async fn run_until_exit(worker_pty: PtyManager, controller: Arc<Controller>, exit_signal: Arc<Notify>) -> ShutdownCause {
    let stdin_pty = worker_pty.clone();
    let stdin_forward = tokio::task::spawn_blocking(move || forward_stdin(stdin_pty));

    #[cfg(unix)]
    let mut resize_stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()).ok();
    #[cfg(not(unix))]
    let mut resize_stream = ();
    let resize_pty = worker_pty.clone();

    tokio::select! {
        _ = exit_signal.notified() => {
            stdin_forward.abort();
            ShutdownCause::WorkerExited
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
            controller.stop("signal received").await;
            stdin_forward.abort();
            ShutdownCause::Signal
        }
        _ = wait_for_terminate() => {
            log::info!("received terminate, shutting down");
            controller.stop("signal received").await;
            stdin_forward.abort();
            ShutdownCause::Signal
        }
        _ = forward_resizes(&mut resize_stream, &resize_pty) => {
            unreachable!("resize forwarding never completes on its own")
        }
    }
}

#[cfg(unix)]
async fn wait_for_terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            log::warn!("failed to install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_terminate() {
    std::future::pending::<()>().await;
}

#[cfg(unix)]
async fn forward_resizes(stream: &mut Option<tokio::signal::unix::Signal>, pty: &PtyManager) {
    match stream {
        Some(stream) => loop {
            stream.recv().await;
            if let Some((cols, rows)) = crossterm::terminal::size().ok() {
                if let Err(e) = pty.resize(cols, rows).await {
                    log::warn!("failed to forward resize: {e}");
                }
            }
        },
        None => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn forward_resizes(_stream: &mut (), _pty: &PtyManager) {
    std::future::pending::<()>().await
}

/// Runs on a blocking thread: reads raw bytes from the controlling terminal
/// and writes them straight through to the worker's PTY. Terminates when the
/// PTY write fails (worker gone) or stdin closes.
fn forward_stdin(pty: PtyManager) {
    use std::io::Read;

    let handle = tokio::runtime::Handle::current();
    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let data = buf[..n].to_vec();
                let pty = pty.clone();
                let result = handle.block_on(async move { pty.write(&data).await });
                if result.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("stdin read error: {e}");
                break;
            }
        }
    }
}
