//! Supervisor — launches the wrapped child, injects proxy environment,
//! streams its stdio, and owns its lifecycle.
//!
//! Stdio forwarding uses `tokio::process::Command` plus a line-buffered
//! reader task per stream, for both stdout and stderr.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{TraceError, TraceResult};

/// Minimum per-line buffer capacity for stdio forwarding.
const LINE_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Proxy-related environment variable names removed from the child's
/// inherited environment before re-injecting the tool's own values.
const PROXY_ENV_KEYS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// Builds the child environment: parent environment minus proxy-related
/// keys, plus the tool's own proxy injection and advisory hints.
pub fn build_child_env(port: u16) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| !PROXY_ENV_KEYS.contains(&k.as_str()))
        .collect();

    let proxy_url = format!("http://127.0.0.1:{port}");
    env.insert("HTTP_PROXY".to_string(), proxy_url.clone());
    env.insert("http_proxy".to_string(), proxy_url.clone());
    env.insert("HTTPS_PROXY".to_string(), proxy_url.clone());
    env.insert("https_proxy".to_string(), proxy_url);
    env.insert("NO_PROXY".to_string(), String::new());
    env.insert("no_proxy".to_string(), String::new());
    env.insert("A2A_PROXY".to_string(), "1".to_string());
    env.insert("A2A_TRACE".to_string(), "1".to_string());
    env.insert("A2A_TRACE_UI".to_string(), format!("http://127.0.0.1:{port}"));

    env
}

/// Owns the wrapped child process. Must not be started twice.
pub struct Supervisor {
    started: AtomicBool,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts `argv` with the injected proxy environment and begins
    /// forwarding its stdout/stderr line-by-line. Returns the child's PID.
    pub async fn start(self: &Arc<Self>, argv: &[String], proxy_port: u16) -> TraceResult<u32> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TraceError::AlreadyStarted);
        }

        let (program, args) = argv.split_first().ok_or_else(|| {
            TraceError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ))
        })?;

        let env = build_child_env(proxy_port);
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(TraceError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        info!("started child process {program} (pid {pid})");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, true));
        }

        *self.child.lock().await = Some(child);
        Ok(pid)
    }

    /// Waits for the child to exit and returns its exit code.
    pub async fn wait(&self) -> TraceResult<i32> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut().ok_or_else(|| {
            TraceError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "supervisor was never started",
            ))
        })?;
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(1))
    }

    /// Graceful stop: SIGTERM then a grace window, escalating to SIGKILL.
    pub async fn stop(&self, grace: std::time::Duration) {
        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().and_then(|c| c.id())
        };
        let Some(pid) = pid else { return };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("child did not exit within grace window, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

async fn forward_lines<R>(reader: R, is_stderr: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::with_capacity(LINE_BUFFER_CAPACITY, reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    eprintln!("{line}");
                } else {
                    println!("{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("error reading child output: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_child_env_injects_proxy_vars() {
        std::env::set_var("HTTP_PROXY", "http://stale:9999");
        let env = build_child_env(18080);
        assert_eq!(env.get("HTTP_PROXY").unwrap(), "http://127.0.0.1:18080");
        assert_eq!(env.get("NO_PROXY").unwrap(), "");
        assert_eq!(env.get("A2A_TRACE").unwrap(), "1");
        std::env::remove_var("HTTP_PROXY");
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let supervisor = Arc::new(Supervisor::new());
        let argv = vec!["true".to_string()];
        supervisor.start(&argv, 18080).await.unwrap();
        let result = supervisor.start(&argv, 18080).await;
        assert!(matches!(result, Err(TraceError::AlreadyStarted)));
        let _ = supervisor.wait().await;
    }
}
