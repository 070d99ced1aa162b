//! Relay dispatcher
//!
//! One event loop owns the session registry, the history store and the local
//! connection table. Socket tasks, child watchers and timers only talk to it
//! through [`AgentEvent`]s, so every handler runs to completion without
//! locking anything.
//!
//! Local-plane handlers live in `local.rs`; bridge commands, process
//! lifecycle and the stop state machine live here.

use crate::bridge::BridgeLink;
use crate::daemon::Shutdown;
use crate::e2e::{E2eError, E2eSession};
use crate::history::SessionHistoryStore;
use crate::local::{ConnId, LocalConnection, LocalHandle};
use crate::platform;
use crate::protocol::{
    strip_envelope, BridgeInbound, BridgeOutbound, EndReason, LocalInbound, LocalOutbound,
};
use crate::registry::{Owner, Registry, SessionEntry, SessionError, SessionTimer, TimerKind};
use crate::supervisor::{self, Launch, SpawnRequest, Spawner};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Grace period between SIGTERM and SIGKILL for spawned sessions
pub const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a local owner gets to exit after `session_stop`
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// After this, an unconfirmed stop stops blocking the session id
pub const STOP_SAFETY_WINDOW: Duration = Duration::from_secs(5);

/// Everything the agent loop reacts to
#[derive(Debug)]
pub enum AgentEvent {
    LocalConnected {
        handle: LocalHandle,
    },
    Local {
        conn_id: ConnId,
        message: LocalInbound,
    },
    LocalDisconnected {
        conn_id: ConnId,
    },
    BridgeAuthenticated,
    BridgeDisconnected,
    /// The bridge gave up for good (authentication cannot succeed)
    BridgeFatal {
        reason: String,
    },
    Bridge(BridgeInbound),
    ProcessExited {
        session_id: String,
        pid: u32,
        exit_code: Option<i32>,
    },
    ProcessFailed {
        session_id: String,
        pid: u32,
        error: String,
    },
    TimerFired {
        session_id: String,
        kind: TimerKind,
        token: u64,
    },
}

/// Identity announced to the bridge
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_id: String,
    pub host_name: String,
    pub forward_terminal_output: bool,
}

pub struct Agent {
    pub(crate) settings: AgentSettings,
    pub(crate) registry: Registry,
    pub(crate) history: SessionHistoryStore,
    pub(crate) connections: HashMap<ConnId, LocalConnection>,
    pub(crate) shutdown: Shutdown,
    bridge: BridgeLink,
    spawner: Arc<dyn Spawner>,
    e2e: Box<dyn E2eSession>,
    events: mpsc::UnboundedSender<AgentEvent>,
    /// Authenticated on the current bridge connection
    bridge_registered: bool,
    /// Locals were told the bridge is gone
    bridge_lost: bool,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        history: SessionHistoryStore,
        bridge: BridgeLink,
        spawner: Arc<dyn Spawner>,
        e2e: Box<dyn E2eSession>,
        events: mpsc::UnboundedSender<AgentEvent>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            settings,
            registry: Registry::new(),
            history,
            connections: HashMap::new(),
            shutdown,
            bridge,
            spawner,
            e2e,
            events,
            bridge_registered: false,
            bridge_lost: false,
        }
    }

    /// Process events until shutdown, then tear every session down and
    /// trigger `drained` once the last message is queued
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<AgentEvent>, drained: Shutdown) {
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => break,
                    }
                }
                _ = shutdown.wait() => break,
            }
        }

        self.shutdown_sessions();
        drained.trigger();
    }

    pub fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::LocalConnected { handle } => self.on_local_connected(handle),
            AgentEvent::Local { conn_id, message } => self.on_local_message(conn_id, message),
            AgentEvent::LocalDisconnected { conn_id } => self.on_local_disconnected(conn_id),
            AgentEvent::BridgeAuthenticated => self.on_bridge_authenticated(),
            AgentEvent::BridgeDisconnected => self.on_bridge_disconnected(),
            AgentEvent::BridgeFatal { reason } => {
                tracing::error!("Bridge unavailable until restart: {}", reason);
                self.on_bridge_disconnected();
            }
            AgentEvent::Bridge(msg) => self.on_bridge_message(msg),
            AgentEvent::ProcessExited {
                session_id,
                pid,
                exit_code,
            } => {
                if self.is_current_process(&session_id, pid) {
                    tracing::info!("Session {} exited (code {:?})", session_id, exit_code);
                    self.end_session(&session_id, EndReason::Exited, exit_code, None);
                } else {
                    tracing::debug!("Ignoring exit of stale pid {} for {}", pid, session_id);
                }
            }
            AgentEvent::ProcessFailed {
                session_id,
                pid,
                error,
            } => {
                if self.is_current_process(&session_id, pid) {
                    tracing::warn!("Session {} failed: {}", session_id, error);
                    self.end_session(&session_id, EndReason::Error, None, Some(error));
                }
            }
            AgentEvent::TimerFired {
                session_id,
                kind,
                token,
            } => self.on_timer(&session_id, kind, token),
        }
    }

    fn is_current_process(&self, session_id: &str, pid: u32) -> bool {
        matches!(
            self.registry.get(session_id).map(|entry| &entry.owner),
            Some(Owner::Process(handle)) if handle.pid == pid
        )
    }

    // ---- bridge connection lifecycle ----

    fn on_bridge_authenticated(&mut self) {
        self.bridge_registered = true;

        let sessions = self.registry.list();
        self.bridge.send(&BridgeOutbound::AgentRegister {
            agent_id: self.settings.agent_id.clone(),
            host_name: self.settings.host_name.clone(),
            platform: platform::platform_name().to_string(),
            active_sessions: sessions.iter().map(|s| s.session_id.clone()).collect(),
        });
        for session in &sessions {
            self.bridge.send(&self.register_message(
                &session.session_id,
                &session.path,
                &session.name,
            ));
        }
        tracing::info!(
            "Registered with bridge as {} ({} sessions)",
            self.settings.agent_id,
            sessions.len()
        );

        if std::mem::take(&mut self.bridge_lost) {
            self.broadcast_local(LocalOutbound::BridgeReconnected);
        }

        if let Some(body) = self.e2e.create_key_exchange_message() {
            self.bridge.send(&BridgeOutbound::KeyExchange { body });
        }
    }

    fn on_bridge_disconnected(&mut self) {
        self.bridge_registered = false;
        if !self.bridge_lost {
            self.bridge_lost = true;
            self.broadcast_local(LocalOutbound::BridgeDisconnected);
        }
    }

    fn broadcast_local(&self, msg: LocalOutbound) {
        for conn in self.connections.values().filter(|c| c.authenticated) {
            conn.handle.send(msg.clone());
        }
    }

    fn register_message(&self, session_id: &str, path: &str, name: &str) -> BridgeOutbound {
        BridgeOutbound::RegisterSession {
            session_id: session_id.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            agent_id: self
                .bridge_registered
                .then(|| self.settings.agent_id.clone()),
            agent_host_name: self.settings.host_name.clone(),
        }
    }

    /// Tell the bridge about a newly registered local session
    pub(crate) fn announce_session(&self, session_id: &str) {
        if let Some(entry) = self.registry.get(session_id) {
            self.bridge
                .send(&self.register_message(&entry.id, &entry.path, &entry.name));
        }
    }

    /// Forward a session-scoped event, sealed when E2E is ready
    pub(crate) fn send_session_event(&self, msg: BridgeOutbound) -> bool {
        if !self.e2e.is_ready() {
            return self.bridge.send(&msg);
        }

        let session_id = match &msg {
            BridgeOutbound::TerminalOutput { session_id, .. }
            | BridgeOutbound::ClaudeMessage { session_id, .. }
            | BridgeOutbound::PermissionRequest { session_id, .. }
            | BridgeOutbound::SessionStatus { session_id, .. } => session_id.clone(),
            _ => return self.bridge.send(&msg),
        };
        let sealed = serde_json::to_value(&msg)
            .map_err(|e| E2eError::Encrypt(e.to_string()))
            .and_then(|value| self.e2e.encrypt(&value));
        match sealed {
            Ok(payload) => self
                .bridge
                .send(&BridgeOutbound::Encrypted { session_id, payload }),
            Err(e) => {
                tracing::warn!("Dropping event for {}: {}", session_id, e);
                false
            }
        }
    }

    // ---- bridge commands ----

    fn on_bridge_message(&mut self, msg: BridgeInbound) {
        match msg {
            BridgeInbound::Authenticated { .. } | BridgeInbound::AuthError { .. } => {
                tracing::debug!("Ignoring authentication message outside the handshake");
            }
            BridgeInbound::StartSession {
                session_id,
                path,
                name,
                prompt,
                request_id,
            } => self.start_session(session_id, path, name, prompt, request_id),
            BridgeInbound::ResumeSession {
                session_id,
                path,
                name,
                request_id,
            } => self.resume_session(session_id, path, name, request_id),
            BridgeInbound::StopSession {
                session_id,
                request_id,
            } => self.stop_session(session_id, request_id),
            BridgeInbound::ListAgentSessions { request_id } => {
                self.bridge.send(&BridgeOutbound::AgentSessions {
                    request_id,
                    sessions: self.registry.list(),
                });
            }
            BridgeInbound::TerminalInput { session_id, data } => {
                if !self.deliver_input(&session_id, &data) {
                    tracing::debug!("Dropped bridge input for {}", session_id);
                }
            }
            BridgeInbound::SendMessage {
                session_id,
                content,
            } => match self.registry.get(&session_id).map(|e| &e.owner) {
                Some(Owner::Local(handle)) => {
                    handle.send(LocalOutbound::UserMessage {
                        session_id,
                        content,
                    });
                }
                Some(Owner::Process(handle)) => {
                    handle.write_input(format!("{}\n", content).as_bytes());
                }
                None => tracing::debug!("Message for unknown session {}", session_id),
            },
            BridgeInbound::PermissionResponse { session_id, body } => {
                match self.registry.get(&session_id).map(|e| &e.owner) {
                    Some(Owner::Local(handle)) => {
                        handle.send(LocalOutbound::PermissionResponse {
                            session_id,
                            body: strip_envelope(body),
                        });
                    }
                    Some(Owner::Process(_)) => {
                        tracing::debug!("Spawned session {} takes permissions on stdin", session_id);
                    }
                    None => tracing::debug!("Permission response for unknown session {}", session_id),
                }
            }
            BridgeInbound::KeyExchange { body } => match self.e2e.handle_key_exchange(&body) {
                Ok(()) => tracing::info!("End-to-end encryption ready"),
                Err(e) => tracing::warn!("Key exchange failed: {}", e),
            },
            BridgeInbound::Encrypted { payload } => {
                let inner = self
                    .e2e
                    .decrypt(&payload)
                    .map_err(|e| e.to_string())
                    .and_then(|value| {
                        serde_json::from_value::<BridgeInbound>(value).map_err(|e| e.to_string())
                    });
                match inner {
                    Ok(BridgeInbound::Encrypted { .. }) => {
                        tracing::warn!("Ignoring nested encrypted message");
                    }
                    Ok(inner) => self.on_bridge_message(inner),
                    Err(e) => tracing::warn!("Discarding undecryptable bridge message: {}", e),
                }
            }
            BridgeInbound::Ping => {
                self.bridge.send(&BridgeOutbound::Pong);
            }
            BridgeInbound::Pong => {}
            BridgeInbound::Error { message } => {
                tracing::warn!("Bridge error: {}", message.unwrap_or_default());
            }
        }
    }

    /// Route input to the owner: a local CLI or the child's stdin
    pub(crate) fn deliver_input(&self, session_id: &str, data: &str) -> bool {
        match self.registry.get(session_id).map(|e| &e.owner) {
            Some(Owner::Local(handle)) => handle.send(LocalOutbound::TerminalInput {
                session_id: session_id.to_string(),
                data: data.to_string(),
            }),
            Some(Owner::Process(handle)) => handle.write_input(data.as_bytes()),
            None => false,
        }
    }

    fn reply_error(&self, request_id: Option<String>, session_id: Option<String>, error: &SessionError) {
        tracing::warn!("Request failed: {}", error);
        self.bridge.send(&BridgeOutbound::AgentSessionError {
            request_id,
            session_id,
            error: error.to_string(),
        });
    }

    fn start_session(
        &mut self,
        session_id: Option<String>,
        path: String,
        name: Option<String>,
        prompt: Option<String>,
        request_id: String,
    ) {
        let session_id = session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let cwd = self
            .registry
            .check_available(&session_id)
            .and_then(|()| supervisor::resolve_working_dir(&session_id, Some(path.as_str()), None));
        match cwd {
            Ok(cwd) => self.launch(session_id, cwd, name, Launch::Start { prompt }, request_id),
            Err(e) => self.reply_error(Some(request_id), Some(session_id), &e),
        }
    }

    fn resume_session(
        &mut self,
        session_id: String,
        path: Option<String>,
        name: Option<String>,
        request_id: String,
    ) {
        let remembered = self.history.lookup(&session_id).cloned();
        let cwd = self.registry.check_available(&session_id).and_then(|()| {
            supervisor::resolve_working_dir(
                &session_id,
                path.as_deref(),
                remembered.as_ref().map(|e| e.path.as_str()),
            )
        });
        match cwd {
            Ok(cwd) => {
                let name = name
                    .filter(|n| !n.trim().is_empty())
                    .or(remembered.map(|e| e.name));
                self.launch(session_id, cwd, name, Launch::Resume, request_id)
            }
            Err(e) => self.reply_error(Some(request_id), Some(session_id), &e),
        }
    }

    fn launch(
        &mut self,
        session_id: String,
        cwd: PathBuf,
        name: Option<String>,
        launch: Launch,
        request_id: String,
    ) {
        let path = cwd.display().to_string();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| platform::extract_path_basename(&path).to_string());
        let resumed = launch == Launch::Resume;

        let request = SpawnRequest {
            session_id: session_id.clone(),
            cwd,
            launch,
        };
        let handle = match self.spawner.spawn(request, self.events.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                // Remember the location so the phone can retry with a resume
                if let Err(e) = self.history.record(&session_id, &path, &name) {
                    tracing::warn!("Failed to write session history: {}", e);
                }
                self.reply_error(
                    Some(request_id),
                    Some(session_id),
                    &SessionError::Spawn(e.to_string()),
                );
                return;
            }
        };

        let entry = SessionEntry::new(
            session_id.clone(),
            path.clone(),
            name.clone(),
            Owner::Process(handle.clone()),
        );
        if let Err(e) = self.registry.insert(entry) {
            self.spawner.kill(&handle);
            self.reply_error(Some(request_id), Some(session_id), &e);
            return;
        }

        tracing::info!("Session {} {} in {}", session_id, if resumed { "resumed" } else { "started" }, path);
        let msg = if resumed {
            BridgeOutbound::AgentSessionResumed {
                request_id,
                session_id,
                path,
                name,
            }
        } else {
            BridgeOutbound::AgentSessionStarted {
                request_id,
                session_id,
                path,
                name,
            }
        };
        self.bridge.send(&msg);
    }

    /// Acknowledge immediately; `agent_session_ended` follows once the owner is gone
    fn stop_session(&mut self, session_id: String, request_id: String) {
        let Some(entry) = self.registry.get_mut(&session_id) else {
            self.reply_error(Some(request_id), Some(session_id.clone()), &SessionError::NotFound(session_id));
            return;
        };

        if !entry.stopping {
            entry.stopping = true;
            entry.stop_requested = true;

            match entry.owner.clone() {
                Owner::Process(handle) => {
                    tracing::info!("Stopping session {} (pid {})", session_id, handle.pid);
                    if !self.spawner.terminate(&handle) {
                        tracing::debug!("Terminate signal for pid {} not delivered", handle.pid);
                    }
                    // TerminateProcess is already forceful on Windows
                    if cfg!(unix) {
                        self.arm_timer(&session_id, TimerKind::ForceKill, FORCE_KILL_TIMEOUT);
                    } else {
                        self.arm_timer(&session_id, TimerKind::StopSafety, STOP_SAFETY_WINDOW);
                    }
                }
                Owner::Local(handle) => {
                    tracing::info!("Asking local owner of {} to stop", session_id);
                    handle.send(LocalOutbound::SessionStop {
                        session_id: session_id.clone(),
                        reason: "stopped_by_user".to_string(),
                    });
                    self.arm_timer(&session_id, TimerKind::StopGrace, STOP_GRACE_PERIOD);
                }
            }
        }

        self.bridge.send(&BridgeOutbound::AgentSessionStopping {
            request_id,
            session_id,
        });
    }

    fn arm_timer(&mut self, session_id: &str, kind: TimerKind, delay: Duration) {
        let token = self.registry.next_timer_token();
        let events = self.events.clone();
        let id = session_id.to_string();
        let timer = SessionTimer::start(kind, token, delay, move || async move {
            let _ = events.send(AgentEvent::TimerFired {
                session_id: id,
                kind,
                token,
            });
        });
        if let Some(entry) = self.registry.get_mut(session_id) {
            entry.arm_timer(timer);
        }
    }

    fn on_timer(&mut self, session_id: &str, kind: TimerKind, token: u64) {
        let Some(entry) = self.registry.get_mut(session_id) else {
            return;
        };
        if entry.take_timer(token) != Some(kind) {
            tracing::debug!("Ignoring stale {:?} timer for {}", kind, session_id);
            return;
        }

        match kind {
            TimerKind::ForceKill => {
                if let Owner::Process(handle) = entry.owner.clone() {
                    tracing::warn!(
                        "Session {} ignored SIGTERM; killing pid {}",
                        session_id,
                        handle.pid
                    );
                    self.spawner.kill(&handle);
                }
                self.arm_timer(session_id, TimerKind::StopSafety, STOP_SAFETY_WINDOW);
            }
            TimerKind::StopGrace => {
                if let Owner::Local(handle) = &entry.owner {
                    tracing::info!("Closing owner connection of {}", session_id);
                    handle.close();
                }
                self.arm_timer(session_id, TimerKind::StopSafety, STOP_SAFETY_WINDOW);
            }
            TimerKind::StopSafety => {
                tracing::warn!("Stop of {} was not confirmed; accepting commands again", session_id);
                entry.stopping = false;
                entry.stop_requested = false;
            }
        }
    }

    /// Owner is gone: history first, then viewers, then the bridge
    pub(crate) fn end_session(
        &mut self,
        session_id: &str,
        reason: EndReason,
        exit_code: Option<i32>,
        error: Option<String>,
    ) {
        let Some(entry) = self.registry.remove(session_id) else {
            return;
        };
        let reason = match reason {
            EndReason::Exited | EndReason::Disconnected if entry.stop_requested => {
                EndReason::StoppedByUser
            }
            other => other,
        };

        if let Err(e) = self.history.record(&entry.id, &entry.path, &entry.name) {
            tracing::warn!("Failed to write session history: {}", e);
        }

        for viewer in entry.viewers.values() {
            viewer.send(LocalOutbound::SessionEnded {
                session_id: entry.id.clone(),
                reason,
                exit_code,
            });
            if let Some(conn) = self.connections.get_mut(&viewer.conn_id) {
                conn.session_id = None;
                conn.is_attached = false;
            }
        }
        if let Owner::Local(owner) = &entry.owner {
            if let Some(conn) = self.connections.get_mut(&owner.conn_id) {
                conn.session_id = None;
            }
        }

        tracing::info!("Session {} ended ({:?})", entry.id, reason);
        let msg = match error {
            Some(error) => BridgeOutbound::AgentSessionError {
                request_id: None,
                session_id: Some(entry.id),
                error,
            },
            None => BridgeOutbound::AgentSessionEnded {
                session_id: entry.id,
                reason,
                exit_code,
            },
        };
        self.bridge.send(&msg);
    }

    /// Terminate children and remember every live session
    fn shutdown_sessions(&mut self) {
        self.registry.clear_timers();

        for session_id in self.registry.session_ids() {
            match self.registry.get(&session_id).map(|e| e.owner.clone()) {
                Some(Owner::Process(handle)) => {
                    self.spawner.terminate(&handle);
                }
                Some(Owner::Local(handle)) => {
                    handle.send(LocalOutbound::SessionStop {
                        session_id: session_id.clone(),
                        reason: "shutdown".to_string(),
                    });
                }
                None => continue,
            }
            self.end_session(&session_id, EndReason::Shutdown, None, None);
        }
    }
}
