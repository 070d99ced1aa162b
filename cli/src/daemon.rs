//! Background agent daemon
//!
//! Wires the pieces together: the local listener, the bridge connection and
//! the agent loop that owns all session state. Runs until SIGTERM or Ctrl+C.

use crate::agent::{Agent, AgentSettings};
use crate::auth::{self, CredentialsFile, StaticToken, TokenProvider};
use crate::bridge::{BridgeLink, BridgeManager};
use crate::config::{self, AgentConfig, ConfigError};
use crate::e2e::{self, E2eError};
use crate::history::{self, SessionHistoryStore};
use crate::local;
use crate::platform;
use crate::supervisor::ProcessSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Agent is already running (PID {0})")]
    AlreadyRunning(u32),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("E2E setup failed: {0}")]
    E2e(#[from] E2eError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide shutdown flag, observable from any task
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// PID file path
fn pid_file() -> PathBuf {
    platform::config_dir().join("agent.pid")
}

/// Port file path
fn port_file() -> PathBuf {
    platform::config_dir().join("agent.port")
}

/// Get the running agent's port (reads from port file)
pub fn get_port() -> Option<u16> {
    std::fs::read_to_string(port_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Get agent PID
pub fn get_pid() -> Option<u32> {
    std::fs::read_to_string(pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Check if the agent is running
pub fn is_running() -> bool {
    get_pid().is_some_and(platform::is_process_alive)
}

/// Command-line overrides for the daemon
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub port: Option<u16>,
    pub bridge_url: Option<String>,
    pub host_name: Option<String>,
}

/// File, then environment, then flags
pub fn resolve_config(options: &DaemonOptions) -> Result<AgentConfig, ConfigError> {
    let mut config = AgentConfig::load_or_init(&config::config_file())?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(port) = options.port {
        config.local_port = port;
    }
    if let Some(url) = &options.bridge_url {
        config.bridge_url = Some(url.clone());
    }
    if let Some(host) = &options.host_name {
        config.host_name = host.clone();
    }
    Ok(config)
}

fn token_provider() -> Arc<dyn TokenProvider> {
    match std::env::var("MOBILECLI_AGENT_TOKEN") {
        Ok(token) if !token.is_empty() => Arc::new(StaticToken(token)),
        _ => Arc::new(CredentialsFile::new(auth::credentials_file())),
    }
}

/// Run the agent (blocking - run in background)
pub async fn run(options: DaemonOptions) -> Result<(), DaemonError> {
    if let Some(pid) = get_pid().filter(|pid| platform::is_process_alive(*pid)) {
        return Err(DaemonError::AlreadyRunning(pid));
    }

    let config = resolve_config(&options)?;
    let e2e = e2e::from_key(config.e2e_key.as_deref())?;

    // Loopback only: local CLIs are trusted without a token
    let listener = TcpListener::bind(("127.0.0.1", config.local_port)).await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Agent {} listening on 127.0.0.1:{}", config.agent_id, port);

    let pid_path = pid_file();
    let port_path = port_file();
    platform::write_private(&pid_path, std::process::id().to_string().as_bytes())?;
    platform::write_private(&port_path, port.to_string().as_bytes())?;

    let shutdown = Shutdown::new();
    // Sockets stay open after shutdown until the agent has queued its goodbyes
    let drained = Shutdown::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let link = BridgeLink::default();

    let agent = Agent::new(
        AgentSettings {
            agent_id: config.agent_id.clone(),
            host_name: config.host_name.clone(),
            forward_terminal_output: config.forward_terminal_output,
        },
        SessionHistoryStore::load(history::history_file()),
        link.clone(),
        Arc::new(ProcessSupervisor::new(
            config.assistant_command.clone(),
            config.assistant_args.clone(),
        )),
        e2e,
        events_tx.clone(),
        shutdown.clone(),
    );
    let agent_task = tokio::spawn(agent.run(events_rx, drained.clone()));
    let local_task = tokio::spawn(local::serve(
        listener,
        events_tx.clone(),
        shutdown.clone(),
        drained.clone(),
    ));

    let bridge_task = match &config.bridge_url {
        Some(url) => {
            let manager = BridgeManager::new(
                url.clone(),
                token_provider(),
                link,
                events_tx.clone(),
                shutdown.clone(),
                drained.clone(),
            );
            Some(tokio::spawn(manager.run()))
        }
        None => {
            tracing::info!("No bridge URL configured; serving local sessions only");
            None
        }
    };
    drop(events_tx);

    wait_for_signal(&shutdown).await;
    shutdown.trigger();

    if let Err(e) = agent_task.await {
        tracing::error!("Agent loop ended abnormally: {}", e);
    }
    drained.trigger();
    let _ = local_task.await;
    if let Some(task) = bridge_task {
        let _ = task.await;
    }

    // Cleanup
    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(&port_path);
    tracing::info!("Agent stopped");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C (or an internal shutdown)
#[cfg(unix)]
async fn wait_for_signal(shutdown: &Shutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(
                "Failed to set up SIGTERM handler: {:?}. Only Ctrl+C will work for shutdown.",
                e
            );
            return wait_for_ctrl_c(shutdown).await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Agent shutting down (Ctrl+C)"),
        _ = sigterm.recv() => tracing::info!("Agent shutting down (SIGTERM)"),
        _ = shutdown.wait() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown: &Shutdown) {
    wait_for_ctrl_c(shutdown).await
}

async fn wait_for_ctrl_c(shutdown: &Shutdown) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Agent shutting down (Ctrl+C)"),
        _ = shutdown.wait() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_wakes_every_waiter() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.wait().await })
            })
            .collect();

        shutdown.trigger();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .unwrap();
    }
}
