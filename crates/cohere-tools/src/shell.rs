use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Runs a shell command with a hard wall-clock bound. Abstracted so tests can
/// substitute a scripted runner.
pub trait ShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult>;
}

#[derive(Debug, Default)]
pub struct PlatformShellRunner;

/// Per-stream capture bound. Draining continues past it so the child never
/// blocks on a full OS pipe; the tool layer applies its own tighter cap.
const STREAM_CAPTURE_CAP: usize = 2 * 1024 * 1024;

impl ShellRunner for PlatformShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult> {
        let mut child = spawn_shell(cmd, cwd)?;

        // Both pipes are drained on their own threads while the parent waits.
        // Waiting without draining deadlocks as soon as the child fills the
        // OS pipe buffer, which then reads as a spurious timeout.
        let stdout_drain = child.stdout.take().map(drain_stream);
        let stderr_drain = child.stderr.take().map(drain_stream);

        let timed_out = child.wait_timeout(timeout)?.is_none();
        if timed_out {
            child.kill()?;
        }
        let status = child.wait()?;
        Ok(ShellRunResult {
            status: status.code(),
            stdout: join_capture(stdout_drain),
            stderr: join_capture(stderr_drain),
            timed_out,
        })
    }
}

fn drain_stream(mut stream: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut captured = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = STREAM_CAPTURE_CAP.saturating_sub(captured.len());
                    captured.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        captured
    })
}

fn join_capture(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).to_string()
}

fn spawn_shell(cmd: &str, cwd: &Path) -> Result<Child> {
    let cwd = std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
    let mut errors = Vec::new();
    for mut command in shell_candidates(cmd) {
        command
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let program = command.get_program().to_string_lossy().to_string();
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{program}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn command '{cmd}' in '{}': {}",
        cwd.display(),
        errors.join(" | ")
    ))
}

#[cfg(not(target_os = "windows"))]
fn shell_candidates(cmd: &str) -> Vec<Command> {
    ["sh", "bash"]
        .into_iter()
        .map(|shell| {
            let mut command = Command::new(shell);
            command.arg("-lc").arg(cmd);
            command
        })
        .collect()
}

#[cfg(target_os = "windows")]
fn shell_candidates(cmd: &str) -> Vec<Command> {
    let mut cmd_shell = Command::new("cmd");
    cmd_shell.arg("/C").arg(cmd);
    let mut ps_shell = Command::new("powershell");
    ps_shell
        .arg("-NoLogo")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(cmd);
    vec![cmd_shell, ps_shell]
}
