//! Dispatcher strategies: how a supervisor turn is actually run.
//!
//! All three satisfy the same `Dispatcher` contract. [`PrintModeDispatcher`]
//! spawns a fresh one-shot agent process per turn; [`InteractiveDispatcher`]
//! keeps a single long-lived agent alive in its own PTY;
//! [`MockDispatcher`] always continues, for exercising the rest of the loop
//! without a second real agent process.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;

use crate::pty::PtyManager;
use crate::session::ToolHistoryEntry;
use crate::supervisor::decision::Decision;
use crate::supervisor::prompt::{build_interactive_prompt, build_print_mode_prompt, parse_response};

/// Everything a dispatcher needs to build a prompt and judge the turn.
pub struct DecisionContext<'a> {
    pub task_description: &'a str,
    pub transcript_path: Option<&'a str>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub tool_history: &'a [ToolHistoryEntry],
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationProgress {
    pub current: u32,
    pub max: u32,
    pub percentage: f32,
    pub consecutive_failures: u32,
}

/// A dispatch attempt either produces a `Decision` or fails outright (process
/// spawn error, non-zero exit, timeout). Failure is distinct from a
/// `Decision::Continue` — it is what feeds the consecutive-failure counter
/// in [`crate::supervisor::runtime::SupervisorRuntime`], which owns the
/// degrade-or-abort policy; individual strategies never make that call.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn decide(&self, ctx: DecisionContext<'_>) -> Result<Decision, String>;
}

/// Spawns a fresh supervisor process per turn via the agent binary's
/// one-shot print mode. No state survives between turns except the
/// consecutive-failure counter, owned by the caller.
pub struct PrintModeDispatcher {
    agent_bin: String,
    print_flag: String,
    bypass_flag: String,
    timeout: Duration,
}

impl PrintModeDispatcher {
    pub fn new(agent_bin: String, print_flag: String, bypass_flag: String, timeout: Duration) -> Self {
        Self {
            agent_bin,
            print_flag,
            bypass_flag,
            timeout,
        }
    }

    async fn run_turn(&self, prompt: &str) -> Result<String, String> {
        let mut cmd = tokio::process::Command::new(&self.agent_bin);
        cmd.arg(&self.print_flag)
            .arg(&self.bypass_flag)
            .arg(prompt)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| format!("failed to spawn supervisor: {e}"))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| "supervisor turn timed out".to_string())?
            .map_err(|e| format!("supervisor process error: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "supervisor exited with {}: {}",
                output.status, stderr
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Dispatcher for PrintModeDispatcher {
    async fn decide(&self, ctx: DecisionContext<'_>) -> Result<Decision, String> {
        let prompt = build_print_mode_prompt(
            ctx.task_description,
            ctx.current_iteration,
            ctx.max_iterations,
            ctx.tool_history,
        );

        let reply = self.run_turn(&prompt).await?;
        Ok(parse_response(&reply))
    }
}

/// Shared slot the supervisor's own Stop hook (routed separately from the
/// worker's, see the hooks ingress) writes its transcript path into. The
/// hooks ingress layer is the sole writer (`set`); [`InteractiveDispatcher`]
/// is the sole reader (`wait_for_next` / `take_transcript_path`).
#[derive(Clone)]
pub struct SupervisorStopSlot {
    inner: std::sync::Arc<SupervisorStopSlotInner>,
}

struct SupervisorStopSlotInner {
    notify: tokio::sync::Notify,
    transcript_path: tokio::sync::Mutex<Option<String>>,
}

impl Default for SupervisorStopSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorStopSlot {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(SupervisorStopSlotInner {
                notify: tokio::sync::Notify::new(),
                transcript_path: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Called by the `/api/supervisor/stop` handler with that turn's
    /// transcript path.
    pub async fn set(&self, transcript_path: String) {
        *self.inner.transcript_path.lock().await = Some(transcript_path);
        self.inner.notify.notify_one();
    }

    /// Awaits the next Stop from the supervisor's own hook.
    pub async fn wait_for_next(&self) {
        self.inner.notify.notified().await;
    }

    /// Takes the transcript path delivered by the most recent `set`, if any.
    pub async fn take_transcript_path(&self) -> Option<String> {
        self.inner.transcript_path.lock().await.take()
    }
}

/// Long-lived supervisor running in its own PTY, anchored to an isolated
/// working directory so its tool state never collides with the worker's.
/// The supervisor's own Stop hook (routed separately from the worker's, see
/// the hooks ingress) signals turn completion; this dispatcher only reads
/// the resulting transcript back out.
pub struct InteractiveDispatcher {
    pty: PtyManager,
    agent_bin: String,
    working_dir: PathBuf,
    timeout: Duration,
    started: tokio::sync::Mutex<bool>,
    alive: std::sync::Arc<std::sync::atomic::AtomicBool>,
    restarted_once: std::sync::Arc<std::sync::atomic::AtomicBool>,
    turn_complete: SupervisorStopSlot,
}

impl InteractiveDispatcher {
    pub fn new(
        agent_bin: String,
        working_dir: PathBuf,
        timeout: Duration,
        turn_complete: SupervisorStopSlot,
    ) -> Self {
        Self {
            pty: PtyManager::new("supervisor"),
            agent_bin,
            working_dir,
            timeout,
            started: tokio::sync::Mutex::new(false),
            alive: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            restarted_once: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            turn_complete,
        }
    }

    pub fn pty(&self) -> &PtyManager {
        &self.pty
    }

    /// Lazily starts the supervisor PTY on first use. On unexpected death,
    /// transparently restarts once before the caller would see a failure;
    /// a second death in a row is reported up (no restart loop).
    async fn ensure_started(&self, on_bytes: crate::pty::OnBytes) -> Result<(), String> {
        use std::sync::atomic::Ordering;

        let mut started = self.started.lock().await;
        if *started && self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }
        if *started && !self.restarted_once.swap(true, Ordering::SeqCst) {
            log::warn!("interactive supervisor PTY died, restarting once");
            let _ = self.pty.cleanup().await;
        } else if *started {
            return Err("interactive supervisor PTY died twice in a row".to_string());
        }

        let cwd = self.working_dir.to_string_lossy().into_owned();
        let alive = self.alive.clone();
        alive.store(true, Ordering::SeqCst);
        let alive_on_exit = alive.clone();
        self.pty
            .spawn(
                &self.agent_bin,
                &[],
                Some(&cwd),
                &std::collections::HashMap::new(),
                120,
                40,
                on_bytes,
                std::sync::Arc::new(move |_exit| {
                    alive_on_exit.store(false, Ordering::SeqCst);
                    log::warn!("interactive supervisor PTY exited");
                }),
            )
            .await
            .map_err(|e| format!("failed to start interactive supervisor: {e}"))?;
        *started = true;
        Ok(())
    }

    /// Sends the prompt followed by a trailing newline, plus a second
    /// newline after a short delay to confirm multi-line paste. This
    /// two-newline trick is a documented workaround for the agent binary's
    /// paste-confirmation prompt and must not be generalized elsewhere.
    async fn send_prompt(&self, prompt: &str) -> Result<(), String> {
        self.pty
            .write_line(prompt)
            .await
            .map_err(|e| format!("failed to write prompt: {e}"))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.pty
            .write(b"\n")
            .await
            .map_err(|e| format!("failed to write confirmation newline: {e}"))?;
        Ok(())
    }

    async fn read_last_assistant_text(&self, transcript_path: &str) -> Result<String, String> {
        let file = tokio::fs::File::open(transcript_path)
            .await
            .map_err(|e| format!("failed to open transcript {transcript_path}: {e}"))?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut last_text: Option<String> = None;

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            if value.get("type").and_then(|t| t.as_str()) != Some("assistant") {
                continue;
            }
            let Some(content) = value.get("message").and_then(|m| m.get("content")) else {
                continue;
            };
            if let Some(text) = content.as_str() {
                last_text = Some(text.to_string());
                continue;
            }
            if let Some(blocks) = content.as_array() {
                let joined: Vec<String> = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .map(|s| s.to_string())
                    .collect();
                if !joined.is_empty() {
                    last_text = Some(joined.join("\n"));
                }
            }
        }

        last_text.ok_or_else(|| "transcript contained no assistant reply".to_string())
    }
}

#[async_trait]
impl Dispatcher for InteractiveDispatcher {
    async fn decide(&self, ctx: DecisionContext<'_>) -> Result<Decision, String> {
        // The worker's own transcript (not the supervisor's) feeds the
        // replayed-role-tagged-lines prompt; a missing path degrades to an
        // empty transcript rather than failing the turn outright.
        let transcript_lines: Vec<String> = match ctx.transcript_path {
            Some(path) => read_transcript_as_lines(path).await.unwrap_or_default(),
            None => Vec::new(),
        };

        let prompt = build_interactive_prompt(
            ctx.task_description,
            ctx.current_iteration,
            ctx.max_iterations,
            &transcript_lines,
        );

        let broadcaster_noop: crate::pty::OnBytes = std::sync::Arc::new(|_| {});
        self.ensure_started(broadcaster_noop).await?;
        self.send_prompt(&prompt).await?;

        tokio::time::timeout(self.timeout, self.turn_complete.wait_for_next())
            .await
            .map_err(|_| "supervisor turn timed out".to_string())?;

        let transcript_path = self
            .turn_complete
            .take_transcript_path()
            .await
            .ok_or_else(|| "supervisor stop carried no transcript path".to_string())?;

        let reply = self.read_last_assistant_text(&transcript_path).await?;
        Ok(parse_response(&reply))
    }
}

async fn read_transcript_as_lines(path: &str) -> Result<Vec<String>, String> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("failed to open transcript {path}: {e}"))?;
    let mut reader = tokio::io::BufReader::new(file).lines();
    let mut out = Vec::new();

    while let Ok(Some(line)) = reader.next_line().await {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("user") => {
                if let Some(text) = extract_content_text(&value) {
                    out.push(format!("USER: {text}"));
                }
            }
            Some("assistant") => {
                if let Some(text) = extract_content_text(&value) {
                    out.push(format!("ASSISTANT: {text}"));
                }
            }
            Some("tool_use") => {
                if let Some(name) = value.get("tool_name").and_then(|v| v.as_str()) {
                    out.push(format!("TOOL_USE: {name}"));
                }
            }
            Some("tool_result") => {
                let is_error = value.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
                out.push(format!("TOOL_RESULT: {}", if is_error { "error" } else { "ok" }));
            }
            _ => {}
        }
    }

    Ok(out)
}

fn extract_content_text(value: &serde_json::Value) -> Option<String> {
    let content = value.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content.as_array().map(|blocks| {
        blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

/// Always returns `continue`; used for `--mock-supervisor`.
pub struct MockDispatcher;

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, String> {
        Ok(Decision::continue_monitoring("mock supervisor always continues", 1.0))
    }
}
