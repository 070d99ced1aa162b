//! Local listener
//!
//! CLI instances on this host connect over a loopback WebSocket. Each
//! connection either registers a session (owner) or attaches to one
//! (viewer). The socket tasks only translate frames; every decision is made
//! by the agent loop.

use crate::agent::{Agent, AgentEvent};
use crate::daemon::Shutdown;
use crate::platform;
use crate::protocol::{
    strip_envelope, BridgeOutbound, EndReason, Fields, LocalInbound, LocalOutbound,
};
use crate::registry::{Owner, SessionEntry, SessionError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

/// Identifies one local connection for its lifetime
pub type ConnId = u64;

/// Instructions for a connection's socket task
#[derive(Debug)]
pub enum ConnCommand {
    Send(LocalOutbound),
    Close,
}

/// Cheap, cloneable sender half of a local connection
#[derive(Debug, Clone)]
pub struct LocalHandle {
    pub conn_id: ConnId,
    tx: mpsc::UnboundedSender<ConnCommand>,
}

impl LocalHandle {
    pub fn new(conn_id: ConnId, tx: mpsc::UnboundedSender<ConnCommand>) -> Self {
        Self { conn_id, tx }
    }

    /// Fire-and-forget; false once the connection is gone
    pub fn send(&self, msg: LocalOutbound) -> bool {
        self.tx.send(ConnCommand::Send(msg)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(ConnCommand::Close);
    }
}

/// Role bookkeeping for one connection
#[derive(Debug)]
pub struct LocalConnection {
    pub handle: LocalHandle,
    pub authenticated: bool,
    /// Set by `register_session` or `attach_session`
    pub session_id: Option<String>,
    /// Viewer rather than owner
    pub is_attached: bool,
}

impl LocalConnection {
    pub fn new(handle: LocalHandle) -> Self {
        Self {
            handle,
            authenticated: false,
            session_id: None,
            is_attached: false,
        }
    }
}

/// Longest wait for connection tasks to flush once drained
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Accept local connections until shutdown. Open connections keep delivering
/// what the agent queues until `drained`, then flush and close.
pub async fn serve(
    listener: TcpListener,
    events: mpsc::UnboundedSender<AgentEvent>,
    shutdown: Shutdown,
    drained: Shutdown,
) {
    let mut next_conn_id: ConnId = 0;
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        next_conn_id += 1;
                        let conn_id = next_conn_id;
                        let events = events.clone();
                        let drained = drained.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, conn_id, events, drained).await {
                                tracing::debug!("Local connection {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept local connection: {}", e),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.wait() => break,
        }
    }
    drop(listener);

    drained.wait().await;
    let finished = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        tracing::warn!("Closing {} local connection(s) without flushing", connections.len());
        connections.abort_all();
    }
}

/// Why a connection's loop ended
enum ConnEnd {
    /// The peer is gone; nothing more can be written
    Gone,
    /// The agent asked for the connection to be closed
    CloseRequested,
    /// The agent is done; write what it queued, then close
    Drain,
}

type LocalSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_local(tx: &mut LocalSink, msg: &LocalOutbound) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => tx.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to encode local message: {}", e);
            true
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: ConnId,
    events: mpsc::UnboundedSender<AgentEvent>,
    drained: Shutdown,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = accept_async(stream).await?;
    let (mut tx, mut rx) = ws.split();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ConnCommand>();
    events.send(AgentEvent::LocalConnected {
        handle: LocalHandle::new(conn_id, cmd_tx),
    })?;
    tracing::debug!("Local client connected: {} (#{})", addr, conn_id);

    let end = loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(ConnCommand::Send(msg)) => {
                        if !send_local(&mut tx, &msg).await {
                            break ConnEnd::Gone;
                        }
                    }
                    Some(ConnCommand::Close) | None => break ConnEnd::CloseRequested,
                }
            }

            result = rx.next() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<LocalInbound>(&text) {
                            Ok(message) => {
                                if events.send(AgentEvent::Local { conn_id, message }).is_err() {
                                    break ConnEnd::Drain;
                                }
                            }
                            Err(e) => tracing::warn!("Discarding malformed message from #{}: {}", conn_id, e),
                        }
                    }
                    Some(Ok(Message::Ping(d))) => { let _ = tx.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Close(_))) | None => break ConnEnd::Gone,
                    Some(Err(e)) => {
                        tracing::debug!("Local connection #{} error: {}", conn_id, e);
                        break ConnEnd::Gone;
                    }
                    _ => {}
                }
            }

            _ = drained.wait() => break ConnEnd::Drain,
        }
    };

    match end {
        ConnEnd::Gone => {}
        ConnEnd::CloseRequested => {
            let _ = tx.send(Message::Close(None)).await;
        }
        ConnEnd::Drain => {
            while let Ok(command) = cmd_rx.try_recv() {
                match command {
                    ConnCommand::Send(msg) => {
                        if !send_local(&mut tx, &msg).await {
                            break;
                        }
                    }
                    ConnCommand::Close => break,
                }
            }
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    let _ = events.send(AgentEvent::LocalDisconnected { conn_id });
    tracing::debug!("Local client disconnected: {} (#{})", addr, conn_id);
    Ok(())
}

/// Session-scoped event produced by an owner
#[derive(Debug, Clone)]
pub(crate) enum OwnerEvent {
    TerminalOutput(String),
    ClaudeMessage(Fields),
    PermissionRequest(Fields),
    SessionStatus(Fields),
}

impl OwnerEvent {
    fn to_local(&self, session_id: &str) -> LocalOutbound {
        let session_id = session_id.to_string();
        match self.clone() {
            OwnerEvent::TerminalOutput(data) => LocalOutbound::TerminalOutput { session_id, data },
            OwnerEvent::ClaudeMessage(body) => LocalOutbound::ClaudeMessage { session_id, body },
            OwnerEvent::PermissionRequest(body) => {
                LocalOutbound::PermissionRequest { session_id, body }
            }
            OwnerEvent::SessionStatus(body) => LocalOutbound::SessionStatus { session_id, body },
        }
    }

    fn into_bridge(self, session_id: &str) -> BridgeOutbound {
        let session_id = session_id.to_string();
        match self {
            OwnerEvent::TerminalOutput(data) => BridgeOutbound::TerminalOutput { session_id, data },
            OwnerEvent::ClaudeMessage(body) => BridgeOutbound::ClaudeMessage { session_id, body },
            OwnerEvent::PermissionRequest(body) => {
                BridgeOutbound::PermissionRequest { session_id, body }
            }
            OwnerEvent::SessionStatus(body) => BridgeOutbound::SessionStatus { session_id, body },
        }
    }
}

// Local-plane handlers
impl Agent {
    pub(crate) fn on_local_connected(&mut self, handle: LocalHandle) {
        self.connections
            .insert(handle.conn_id, LocalConnection::new(handle));
    }

    pub(crate) fn on_local_message(&mut self, conn_id: ConnId, message: LocalInbound) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        if matches!(message, LocalInbound::Authenticate { .. }) {
            conn.authenticated = true;
        }
        let authenticated = conn.authenticated;
        let handle = conn.handle.clone();

        match message {
            LocalInbound::Authenticate { .. } => {
                handle.send(LocalOutbound::AuthSuccess);
            }
            LocalInbound::Ping => {
                handle.send(LocalOutbound::Pong);
            }
            _ if !authenticated => {
                handle.send(LocalOutbound::Error {
                    message: SessionError::NotAuthenticated.to_string(),
                });
            }
            LocalInbound::RegisterSession {
                session_id,
                path,
                name,
            } => self.register_local_session(conn_id, session_id, path, name),
            LocalInbound::AttachSession { session_id } => self.attach_viewer(conn_id, session_id),
            LocalInbound::ListSessions => {
                handle.send(LocalOutbound::SessionsList {
                    sessions: self.registry.list(),
                });
            }
            LocalInbound::TerminalInput { session_id, data } => {
                self.viewer_input(conn_id, session_id, data)
            }
            LocalInbound::TerminalOutput { data, .. } => {
                self.owner_event(conn_id, OwnerEvent::TerminalOutput(data))
            }
            LocalInbound::ClaudeMessage { body } => {
                self.owner_event(conn_id, OwnerEvent::ClaudeMessage(strip_envelope(body)))
            }
            LocalInbound::PermissionRequest { body } => {
                self.owner_event(conn_id, OwnerEvent::PermissionRequest(strip_envelope(body)))
            }
            LocalInbound::SessionStatus { body } => {
                self.owner_event(conn_id, OwnerEvent::SessionStatus(strip_envelope(body)))
            }
        }
    }

    pub(crate) fn on_local_disconnected(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };
        let Some(session_id) = conn.session_id else {
            return;
        };

        if conn.is_attached {
            self.registry.detach(&session_id, conn_id);
            tracing::debug!("Viewer #{} left session {}", conn_id, session_id);
            return;
        }

        let owned = self
            .registry
            .get(&session_id)
            .is_some_and(|entry| entry.is_owned_by(conn_id));
        if owned && !self.shutdown.is_triggered() {
            tracing::info!("Owner of session {} disconnected", session_id);
            self.end_session(&session_id, EndReason::Disconnected, None, None);
        }
    }

    fn register_local_session(
        &mut self,
        conn_id: ConnId,
        session_id: String,
        path: String,
        name: Option<String>,
    ) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let handle = conn.handle.clone();

        if let Some(bound) = &conn.session_id {
            handle.send(LocalOutbound::RegisterError {
                session_id,
                error: SessionError::AlreadyBound(bound.clone()).to_string(),
            });
            return;
        }

        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| platform::extract_path_basename(&path).to_string());
        let entry = SessionEntry::new(
            session_id.clone(),
            path,
            name.clone(),
            Owner::Local(handle.clone()),
        );
        if let Err(e) = self.registry.insert(entry) {
            tracing::warn!("Rejected registration of {}: {}", session_id, e);
            handle.send(LocalOutbound::RegisterError {
                session_id,
                error: e.to_string(),
            });
            return;
        }

        conn.session_id = Some(session_id.clone());
        conn.is_attached = false;
        handle.send(LocalOutbound::Registered {
            session_id: session_id.clone(),
        });
        tracing::info!("Local session registered: {} ({})", name, session_id);

        self.announce_session(&session_id);
    }

    fn attach_viewer(&mut self, conn_id: ConnId, session_id: String) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let handle = conn.handle.clone();

        if let Some(bound) = &conn.session_id {
            handle.send(LocalOutbound::AttachError {
                session_id,
                error: SessionError::AlreadyBound(bound.clone()).to_string(),
            });
            return;
        }

        let (name, path) = match self.registry.attach(&session_id, handle.clone()) {
            Ok(entry) => (entry.name.clone(), entry.path.clone()),
            Err(e) => {
                handle.send(LocalOutbound::AttachError {
                    session_id,
                    error: e.to_string(),
                });
                return;
            }
        };

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.session_id = Some(session_id.clone());
            conn.is_attached = true;
        }
        tracing::info!("Viewer #{} attached to session {}", conn_id, session_id);
        handle.send(LocalOutbound::AttachSuccess {
            session_id,
            name,
            path,
        });
    }

    /// Viewer keystrokes go to the owner and nowhere else
    fn viewer_input(&mut self, conn_id: ConnId, requested: Option<String>, data: String) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let Some(session_id) = conn.session_id.clone().filter(|_| conn.is_attached) else {
            conn.handle.send(LocalOutbound::Error {
                message: "Not attached to a session".to_string(),
            });
            return;
        };
        if requested.as_deref().is_some_and(|id| id != session_id) {
            tracing::debug!("Viewer #{} sent input for a session it is not attached to", conn_id);
            return;
        }

        if !self.deliver_input(&session_id, &data) {
            tracing::debug!("Input for session {} dropped", session_id);
        }
    }

    /// Fan an owner event out to every viewer, then upstream
    fn owner_event(&mut self, conn_id: ConnId, event: OwnerEvent) {
        let Some(session_id) = self.registry.owned_by(conn_id).map(str::to_string) else {
            tracing::debug!("Ignoring session event from #{} which owns no session", conn_id);
            return;
        };

        for viewer in self.registry.viewers(&session_id) {
            viewer.send(event.to_local(&session_id));
        }

        if matches!(event, OwnerEvent::TerminalOutput(_)) && !self.settings.forward_terminal_output {
            return;
        }
        self.send_session_event(event.into_bridge(&session_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_open_connections_flush_before_closing_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();
        let drained = Shutdown::new();
        let server = tokio::spawn(serve(listener, events_tx, shutdown.clone(), drained.clone()));

        let (mut client, _) = connect_async(format!("ws://127.0.0.1:{}", port)).await.unwrap();
        let handle = match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(AgentEvent::LocalConnected { handle }) => handle,
            other => panic!("unexpected event: {:?}", other),
        };

        // Accepting stops, but the connection outlives the shutdown flag
        shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());

        // Queued during teardown, immediately followed by the all-clear
        assert!(handle.send(LocalOutbound::SessionStop {
            session_id: "s1".to_string(),
            reason: "shutdown".to_string(),
        }));
        drained.trigger();

        let mut got_stop = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), client.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => {
                    let msg: LocalOutbound = serde_json::from_str(&text).unwrap();
                    got_stop |= matches!(
                        msg,
                        LocalOutbound::SessionStop { ref reason, .. } if reason == "shutdown"
                    );
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        assert!(got_stop);

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }
}
