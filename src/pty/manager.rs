//! Single-session pseudo-terminal lifecycle.
//!
//! One [`PtyManager`] owns at most one live child process at a time. The
//! lifecycle orchestrator constructs one instance for the worker and, when
//! the interactive supervisor strategy is selected, a second independent
//! instance for the supervisor's own PTY — the two never share state.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use super::error::PtyError;

/// Stateful UTF-8 decoder that handles multi-byte sequences split across
/// PTY read chunks. `String::from_utf8_lossy` on a raw chunk boundary would
/// replace a legitimate split sequence with U+FFFD; this buffers the
/// incomplete tail and prepends it to the next chunk instead.
pub(crate) struct Utf8Decoder {
    incomplete: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            incomplete: Vec::with_capacity(4),
        }
    }

    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let valid_up_to = Self::find_valid_boundary(&data);
        if valid_up_to < data.len() {
            self.incomplete = data[valid_up_to..].to_vec();
        }

        String::from_utf8(data[..valid_up_to].to_vec())
            .unwrap_or_else(|_| String::from_utf8_lossy(&data[..valid_up_to]).into_owned())
    }

    fn find_valid_boundary(data: &[u8]) -> usize {
        match std::str::from_utf8(data) {
            Ok(_) => data.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_none() {
                    valid
                } else {
                    valid + e.error_len().unwrap_or(1)
                }
            }
        }
    }
}

/// Exit status reported by the child process.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

struct RunningSession {
    writer: AsyncMutex<Box<dyn Write + Send>>,
    master: AsyncMutex<Box<dyn MasterPty + Send>>,
    child_pid: i32,
    #[cfg(unix)]
    pgid: i32,
    shutdown: Arc<Notify>,
    reader_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Callback invoked with each chunk of decoded worker output.
pub type OnBytes = Arc<dyn Fn(String) + Send + Sync>;
/// Callback invoked exactly once, at the true process exit.
pub type OnExit = Arc<dyn Fn(ExitStatus) + Send + Sync>;

#[derive(Clone)]
pub struct PtyManager {
    session: Arc<AsyncMutex<Option<RunningSession>>>,
    label: &'static str,
}

impl PtyManager {
    /// `label` is used only in log lines (`"worker"` / `"supervisor"`) to
    /// disambiguate the two independent instances in a combined log stream.
    pub fn new(label: &'static str) -> Self {
        Self {
            session: Arc::new(AsyncMutex::new(None)),
            label,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Spawns `command` in a fresh pseudo-terminal. Fails with
    /// [`PtyError::already_running`] if a session is already live.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&str>,
        env: &HashMap<String, String>,
        cols: u16,
        rows: u16,
        on_bytes: OnBytes,
        on_exit: OnExit,
    ) -> Result<i32, PtyError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(PtyError::already_running());
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::spawn_failed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(command);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::spawn_failed(format!("failed to spawn: {e}")))?;

        let child_pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| PtyError::spawn_failed("could not obtain child PID"))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(child_pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::spawn_failed(format!("failed to take PTY writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::spawn_failed(format!("failed to clone PTY reader: {e}")))?;

        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);

        let label = self.label;
        let reader_handle = std::thread::Builder::new()
            .name(format!("{label}-pty-reader"))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                log::warn!("{label} PTY: channel closed, dropping {n} bytes");
                                break;
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("{label} PTY reader error: {e}");
                            break;
                        }
                    }
                }
                log::debug!("{label} PTY reader exited");
            })
            .map_err(|e| PtyError::spawn_failed(format!("failed to spawn reader thread: {e}")))?;

        tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();
            loop {
                tokio::select! {
                    data = rx.recv() => {
                        match data {
                            Some(bytes) => {
                                let text = decoder.decode(&bytes);
                                if !text.is_empty() {
                                    on_bytes(text);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_clone.notified() => break,
                }
            }
            log::debug!("{label} PTY output relay exited");
        });

        // Child-exit watcher. This, not a PTY-close callback, is the source
        // of truth for the real exit code — PTY close and process exit fire
        // at different moments.
        let exit_shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || {
            let mut child = child;
            let status = child.wait();
            let exit = match status {
                Ok(s) => ExitStatus {
                    code: s.exit_code().try_into().ok(),
                    signal: None,
                },
                Err(e) => {
                    log::warn!("{label}: error waiting on child: {e}");
                    ExitStatus {
                        code: None,
                        signal: None,
                    }
                }
            };
            on_exit(exit);
            exit_shutdown.notify_one();
        });

        drop(pair.slave);

        *slot = Some(RunningSession {
            writer: AsyncMutex::new(writer),
            master: AsyncMutex::new(pair.master),
            child_pid,
            #[cfg(unix)]
            pgid,
            shutdown,
            reader_handle: AsyncMutex::new(Some(reader_handle)),
        });

        log::info!("{label}: spawned pid={child_pid}");
        Ok(child_pid)
    }

    /// Writes raw bytes to the PTY master (the worker's stdin).
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let slot = self.session.lock().await;
        let session = slot.as_ref().ok_or_else(PtyError::not_running)?;
        let mut writer = session.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| PtyError::write_failed(format!("write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| PtyError::write_failed(format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Convenience wrapper that appends a trailing newline, matching how a
    /// human would confirm a typed line in the worker's shell prompt.
    pub async fn write_line(&self, line: &str) -> Result<(), PtyError> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.write(&data).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let slot = self.session.lock().await;
        let session = slot.as_ref().ok_or_else(PtyError::not_running)?;
        let master = session.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::resize_failed(format!("resize failed: {e}")))?;
        Ok(())
    }

    pub async fn pid(&self) -> Option<i32> {
        self.session.lock().await.as_ref().map(|s| s.child_pid)
    }

    /// Sends a graceful termination signal, waits briefly, escalates to a
    /// forceful kill if still alive, and closes both PTY endpoints.
    /// Idempotent: a second call on an already-cleaned-up session is a no-op.
    pub async fn cleanup(&self) -> Result<(), PtyError> {
        let session = {
            let mut slot = self.session.lock().await;
            match slot.take() {
                Some(s) => s,
                None => return Ok(()),
            }
        };

        let label = self.label;
        let pid = session.child_pid;

        #[cfg(unix)]
        {
            let pgid = session.pgid;
            let term_result = unsafe { libc::kill(-pgid, libc::SIGTERM) };
            if term_result != 0 {
                log::warn!(
                    "{label}: failed to SIGTERM pgid={pgid}: {}",
                    std::io::Error::last_os_error()
                );
            }

            let exited = tokio::time::timeout(std::time::Duration::from_secs(3), async {
                loop {
                    let result = unsafe { libc::kill(pid, 0) };
                    if result != 0 {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            })
            .await;

            if exited.is_err() {
                let kill_result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
                if kill_result != 0 {
                    log::warn!(
                        "{label}: failed to SIGKILL pgid={pgid}: {}",
                        std::io::Error::last_os_error()
                    );
                }
                log::warn!("{label}: pid={pid} pgid={pgid} required SIGKILL");
            }
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            if let Err(e) = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output()
            {
                log::warn!("{label}: failed to taskkill pid={pid}: {e}");
            }
        }

        session.shutdown.notify_one();
        drop(session.writer);
        drop(session.master);

        let reader_handle = {
            let mut h = session.reader_handle.lock().await;
            h.take()
        };
        if let Some(handle) = reader_handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        log::info!("{label}: cleaned up pid={pid}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::error::PtyErrorCode;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn write_without_spawn_fails_not_running() {
        let pty = PtyManager::new("test");
        let err = pty.write(b"hello").await.unwrap_err();
        assert!(matches!(err.code, PtyErrorCode::NotRunning));
    }

    #[tokio::test]
    async fn cleanup_without_spawn_is_idempotent() {
        let pty = PtyManager::new("test");
        pty.cleanup().await.unwrap();
        pty.cleanup().await.unwrap();
        assert!(!pty.is_running().await);
    }

    #[tokio::test]
    async fn spawn_twice_without_cleanup_fails_already_running() {
        let pty = PtyManager::new("test");
        let got_exit = Arc::new(AtomicBool::new(false));
        let got_exit2 = got_exit.clone();

        pty.spawn(
            "/bin/sh",
            &["-c".to_string(), "sleep 5".to_string()],
            None,
            &HashMap::new(),
            80,
            24,
            Arc::new(|_text| {}),
            Arc::new(move |_exit| {
                got_exit2.store(true, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        let err = pty
            .spawn(
                "/bin/sh",
                &["-c".to_string(), "true".to_string()],
                None,
                &HashMap::new(),
                80,
                24,
                Arc::new(|_| {}),
                Arc::new(|_| {}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.code, PtyErrorCode::AlreadyRunning));

        pty.cleanup().await.unwrap();
        assert!(!pty.is_running().await);
    }

    #[test]
    fn utf8_decoder_buffers_split_sequence() {
        let mut decoder = Utf8Decoder::new();
        // "é" is 0xC3 0xA9; split across two decode() calls.
        let first = decoder.decode(&[b'h', b'i', 0xC3]);
        assert_eq!(first, "hi");
        let second = decoder.decode(&[0xA9, b'!']);
        assert_eq!(second, "é!");
    }
}
