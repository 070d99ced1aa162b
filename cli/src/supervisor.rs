//! Process supervisor
//!
//! Spawns one coding-assistant child per bridge-started session, pipes its
//! stdin, logs its output, and reports its exit back to the agent loop.

use crate::agent::AgentEvent;
use crate::platform;
use crate::registry::SessionError;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Child exited before reporting a pid")]
    NoPid,
}

/// Whether the child starts a fresh conversation or resumes one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    Start { prompt: Option<String> },
    Resume,
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub cwd: PathBuf,
    pub launch: Launch,
}

/// Handle to a spawned child
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ProcessHandle {
    pub fn new(pid: u32, stdin: Option<mpsc::UnboundedSender<Vec<u8>>>) -> Self {
        Self { pid, stdin }
    }

    /// Queue bytes for the child's stdin. False once stdin is gone.
    pub fn write_input(&self, data: &[u8]) -> bool {
        match &self.stdin {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        }
    }
}

/// Seam between the dispatcher and real child processes
pub trait Spawner: Send + Sync {
    /// Start the child. Its exit is reported as `ProcessExited`/`ProcessFailed`.
    fn spawn(
        &self,
        request: SpawnRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<ProcessHandle, SupervisorError>;

    /// Ask the child to exit
    fn terminate(&self, handle: &ProcessHandle) -> bool;

    /// Force the child to exit
    fn kill(&self, handle: &ProcessHandle) -> bool;
}

/// Spawns the configured assistant command with tokio
pub struct ProcessSupervisor {
    command: String,
    extra_args: Vec<String>,
}

impl ProcessSupervisor {
    pub fn new(command: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            extra_args,
        }
    }

    fn build_args(&self, request: &SpawnRequest) -> Vec<String> {
        let mut args = self.extra_args.clone();
        match &request.launch {
            Launch::Start { prompt } => {
                args.push("--session-id".to_string());
                args.push(request.session_id.clone());
                if let Some(prompt) = prompt.as_ref().filter(|p| !p.trim().is_empty()) {
                    args.push(prompt.clone());
                }
            }
            Launch::Resume => {
                args.push("--resume".to_string());
                args.push(request.session_id.clone());
            }
        }
        args
    }
}

impl Spawner for ProcessSupervisor {
    fn spawn(
        &self,
        request: SpawnRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let program = which::which(&self.command)
            .map_err(|_| SupervisorError::CommandNotFound(self.command.clone()))?;

        let mut child = Command::new(program)
            .args(self.build_args(&request))
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id().ok_or(SupervisorError::NoPid)?;
        let session_id = request.session_id;

        tracing::info!(
            "Spawned {} for session {} (pid {}) in {}",
            self.command,
            session_id,
            pid,
            request.cwd.display()
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(session_id.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(session_id.clone(), "stderr", stderr));
        }

        let stdin_tx = child.stdin.take().map(|mut stdin| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
            tx
        });

        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => AgentEvent::ProcessExited {
                    session_id,
                    pid,
                    exit_code: status.code(),
                },
                Err(e) => AgentEvent::ProcessFailed {
                    session_id,
                    pid,
                    error: e.to_string(),
                },
            };
            let _ = events.send(event);
        });

        Ok(ProcessHandle::new(pid, stdin_tx))
    }

    fn terminate(&self, handle: &ProcessHandle) -> bool {
        platform::terminate_process(handle.pid)
    }

    fn kill(&self, handle: &ProcessHandle) -> bool {
        platform::kill_process(handle.pid)
    }
}

/// Longest chunk logged as one line
const MAX_LOG_LINE: u64 = 8 * 1024;

/// Give up on a stream after this many read errors in a row
const MAX_READ_ERRORS: u32 = 16;

/// Child output is only logged. The pipe is drained to EOF whatever the
/// bytes are, so the child never writes into a closed pipe.
async fn log_lines<R>(session_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut errors = 0;

    loop {
        buf.clear();
        match (&mut reader).take(MAX_LOG_LINE).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                errors = 0;
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!("[{}] {}: {}", session_id, stream, line.trim_end());
            }
            Err(e) => {
                errors += 1;
                tracing::debug!("[{}] {} read error: {}", session_id, stream, e);
                if errors >= MAX_READ_ERRORS {
                    tracing::warn!("[{}] Stopped reading {} after repeated errors", session_id, stream);
                    break;
                }
            }
        }
    }
}

/// Pick and validate the working directory for a start or resume.
///
/// The requested path wins; otherwise the remembered one from history. With
/// neither, the caller gets an error rather than a default directory.
pub fn resolve_working_dir(
    session_id: &str,
    requested: Option<&str>,
    remembered: Option<&str>,
) -> Result<PathBuf, SessionError> {
    let raw = requested
        .filter(|p| !p.trim().is_empty())
        .or(remembered.filter(|p| !p.trim().is_empty()))
        .ok_or_else(|| SessionError::UnknownPath(session_id.to_string()))?;

    let path = platform::expand_tilde(raw.trim());
    if !path.is_dir() {
        return Err(SessionError::PathNotFound(path.display().to_string()));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(launch: Launch) -> SpawnRequest {
        SpawnRequest {
            session_id: "abc".to_string(),
            cwd: PathBuf::from("/tmp"),
            launch,
        }
    }

    #[test]
    fn test_start_args() {
        let supervisor = ProcessSupervisor::new("claude", vec!["--verbose".to_string()]);
        let args = supervisor.build_args(&request(Launch::Start {
            prompt: Some("fix the tests".to_string()),
        }));
        assert_eq!(args, vec!["--verbose", "--session-id", "abc", "fix the tests"]);

        let args = supervisor.build_args(&request(Launch::Start {
            prompt: Some("  ".to_string()),
        }));
        assert_eq!(args, vec!["--verbose", "--session-id", "abc"]);
    }

    #[test]
    fn test_resume_args() {
        let supervisor = ProcessSupervisor::new("claude", Vec::new());
        assert_eq!(
            supervisor.build_args(&request(Launch::Resume)),
            vec!["--resume", "abc"]
        );
    }

    #[test]
    fn test_resolve_prefers_requested_path() {
        let requested = TempDir::new().unwrap();
        let remembered = TempDir::new().unwrap();
        let path = resolve_working_dir(
            "s1",
            requested.path().to_str(),
            remembered.path().to_str(),
        )
        .unwrap();
        assert_eq!(path, requested.path());
    }

    #[test]
    fn test_resolve_falls_back_to_history() {
        let remembered = TempDir::new().unwrap();
        let path = resolve_working_dir("s1", None, remembered.path().to_str()).unwrap();
        assert_eq!(path, remembered.path());
    }

    #[test]
    fn test_resolve_without_any_path_fails() {
        assert_eq!(
            resolve_working_dir("s1", None, None).unwrap_err(),
            SessionError::UnknownPath("s1".to_string())
        );
        assert_eq!(
            resolve_working_dir("s1", Some(""), None).unwrap_err(),
            SessionError::UnknownPath("s1".to_string())
        );
    }

    #[test]
    fn test_resolve_missing_directory() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("deleted");
        assert!(matches!(
            resolve_working_dir("s1", gone.to_str(), None),
            Err(SessionError::PathNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_with_binary_output_runs_to_completion() {
        // Invalid UTF-8 first, then enough output to need a live reader,
        // then an unterminated line longer than one log chunk
        let script = "printf '\\377\\n'; printf 'bad \\376\\n' >&2; sleep 0.3; \
                      i=0; while [ $i -lt 2000 ]; do echo line $i; i=$((i+1)); done; \
                      head -c 20000 /dev/zero | tr '\\000' x; exit 0";
        let supervisor = ProcessSupervisor::new("sh", vec!["-c".to_string(), script.to_string()]);
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = supervisor
            .spawn(
                SpawnRequest {
                    session_id: "s1".to_string(),
                    cwd: dir.path().to_path_buf(),
                    launch: Launch::Start { prompt: None },
                },
                tx,
            )
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .expect("child did not exit")
            .unwrap();
        match event {
            AgentEvent::ProcessExited { session_id, pid, exit_code } => {
                assert_eq!(session_id, "s1");
                assert_eq!(pid, handle.pid);
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_write_input_after_stdin_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProcessHandle::new(1, Some(tx));
        assert!(handle.write_input(b"y\n"));
        drop(rx);
        assert!(!handle.write_input(b"y\n"));
        assert!(!ProcessHandle::new(1, None).write_input(b"y\n"));
    }
}
