//! Bridge connection manager
//!
//! Owns the agent's single outbound WebSocket to the cloud relay:
//! - authenticate with the bearer token, refreshing it once on `auth_error`
//! - heartbeat pings while registered
//! - exponential backoff reconnect with jitter
//!
//! Inbound commands are handed to the agent loop as [`AgentEvent`]s; the agent
//! sends through a [`BridgeLink`], which drops messages while the socket is
//! down instead of buffering them.

use crate::agent::AgentEvent;
use crate::auth::TokenProvider;
use crate::daemon::Shutdown;
use crate::protocol::{BridgeInbound, BridgeOutbound};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type BridgeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping interval while registered
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnection strategy with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct ReconnectStrategy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the delay
    jitter_ratio: f64,
    attempt: u32,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectStrategy {
    pub fn new() -> Self {
        Self {
            base_delay_ms: 1000, // Start at 1 second
            max_delay_ms: 30000, // Max 30 seconds
            jitter_ratio: 0.2,
            attempt: 0,
        }
    }

    /// Same schedule without the random component
    #[cfg(test)]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    #[cfg(test)]
    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Get the next delay duration using exponential backoff.
    /// Jitter never pushes the delay past the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(self.attempt))
            .min(self.max_delay_ms);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = if self.jitter_ratio > 0.0 {
            (delay as f64 * rand::thread_rng().gen_range(0.0..=self.jitter_ratio)) as u64
        } else {
            0
        };
        Duration::from_millis(delay.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// Reset the backoff counter (call on successful connection)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Open,
    Authenticating,
    Registered,
}

/// One token refresh per connection attempt
#[derive(Debug, Default)]
pub struct AuthRetry {
    refreshed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Refresh,
    GiveUp,
}

impl AuthRetry {
    pub fn on_auth_error(&mut self) -> AuthDecision {
        if self.refreshed {
            AuthDecision::GiveUp
        } else {
            self.refreshed = true;
            AuthDecision::Refresh
        }
    }
}

/// Sending half shared with the agent loop
#[derive(Debug, Clone, Default)]
pub struct BridgeLink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl BridgeLink {
    /// Queue a message for the open socket. False (and dropped) when closed.
    pub fn send(&self, msg: &BridgeOutbound) -> bool {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode bridge message: {}", e);
                return false;
            }
        };
        match self.tx.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|tx| tx.send(text).is_ok()),
            Err(_) => false,
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.tx.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    pub(crate) fn open(&self, tx: mpsc::UnboundedSender<String>) {
        if let Ok(mut guard) = self.tx.lock() {
            *guard = Some(tx);
        }
    }

    pub(crate) fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            *guard = None;
        }
    }
}

/// How a connection ended
#[derive(Debug)]
enum ConnectionEnd {
    Closed,
    Fatal(String),
    Shutdown,
}

pub struct BridgeManager {
    url: String,
    tokens: Arc<dyn TokenProvider>,
    link: BridgeLink,
    events: mpsc::UnboundedSender<AgentEvent>,
    shutdown: Shutdown,
    /// Set once the agent has queued its last message
    drained: Shutdown,
    strategy: ReconnectStrategy,
    state: BridgeState,
}

impl BridgeManager {
    pub fn new(
        url: String,
        tokens: Arc<dyn TokenProvider>,
        link: BridgeLink,
        events: mpsc::UnboundedSender<AgentEvent>,
        shutdown: Shutdown,
        drained: Shutdown,
    ) -> Self {
        Self {
            url,
            tokens,
            link,
            events,
            shutdown,
            drained,
            strategy: ReconnectStrategy::new(),
            state: BridgeState::Disconnected,
        }
    }

    #[cfg(test)]
    pub fn with_strategy(mut self, strategy: ReconnectStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Connect, serve, reconnect; returns on shutdown or a fatal auth error.
    /// An open connection stays up after shutdown until the agent is drained.
    pub async fn run(mut self) {
        let shutdown = self.shutdown.clone();

        loop {
            if shutdown.is_triggered() {
                break;
            }

            self.state = BridgeState::Connecting;
            tracing::info!("Connecting to bridge: {}", self.url);
            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = shutdown.wait() => break,
            };

            match connected {
                Ok((ws, _)) => {
                    self.strategy.reset();
                    self.state = BridgeState::Open;
                    tracing::info!("Bridge connection open");

                    match self.serve_connection(ws).await {
                        ConnectionEnd::Closed => {
                            tracing::warn!("Bridge connection lost");
                            let _ = self.events.send(AgentEvent::BridgeDisconnected);
                        }
                        ConnectionEnd::Fatal(reason) => {
                            tracing::error!("Bridge authentication failed: {}", reason);
                            self.state = BridgeState::Disconnected;
                            let _ = self.events.send(AgentEvent::BridgeFatal { reason });
                            break;
                        }
                        ConnectionEnd::Shutdown => break,
                    }
                }
                Err(e) => tracing::warn!("Failed to connect to bridge: {}", e),
            }

            self.state = BridgeState::Disconnected;
            let delay = self.strategy.next_delay();
            tracing::info!(
                "Reconnecting to bridge in {:?} (attempt {})",
                delay,
                self.strategy.attempts()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => break,
            }
        }

        self.state = BridgeState::Disconnected;
        self.link.close();
    }

    async fn serve_connection(&mut self, ws: BridgeSocket) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();
        let drained = self.drained.clone();

        let token = match self.tokens.ensure_valid_token() {
            Ok(token) => token,
            Err(e) => return ConnectionEnd::Fatal(e.to_string()),
        };
        self.state = BridgeState::Authenticating;
        if send_json(&mut sink, &BridgeOutbound::Authenticate { token }).await.is_err() {
            return ConnectionEnd::Closed;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.link.open(tx);

        let mut auth = AuthRetry::default();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let end = loop {
            tokio::select! {
                result = stream.next() => {
                    match result {
                        Some(Ok(Message::Text(text))) => {
                            let msg = match serde_json::from_str::<BridgeInbound>(&text) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::warn!("Discarding malformed bridge message: {}", e);
                                    continue;
                                }
                            };
                            match msg {
                                BridgeInbound::Authenticated { user_id } => {
                                    self.state = BridgeState::Registered;
                                    tracing::info!(
                                        "Authenticated with bridge{}",
                                        user_id.map(|u| format!(" as {}", u)).unwrap_or_default()
                                    );
                                    let _ = self.events.send(AgentEvent::BridgeAuthenticated);
                                }
                                BridgeInbound::AuthError { message } => {
                                    let message = message.unwrap_or_else(|| "authentication rejected".to_string());
                                    if auth.on_auth_error() == AuthDecision::GiveUp {
                                        break ConnectionEnd::Fatal(message);
                                    }
                                    tracing::warn!("Bridge rejected token ({}); refreshing", message);
                                    let token = match self.tokens.refresh_id_token() {
                                        Ok(token) => token,
                                        Err(e) => break ConnectionEnd::Fatal(e.to_string()),
                                    };
                                    if send_json(&mut sink, &BridgeOutbound::Authenticate { token }).await.is_err() {
                                        break ConnectionEnd::Closed;
                                    }
                                }
                                other => {
                                    if self.events.send(AgentEvent::Bridge(other)).is_err() {
                                        break ConnectionEnd::Shutdown;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(d))) => { let _ = sink.send(Message::Pong(d)).await; }
                        Some(Ok(Message::Close(_))) | None => break ConnectionEnd::Closed,
                        Some(Err(e)) => {
                            tracing::warn!("Bridge socket error: {}", e);
                            break ConnectionEnd::Closed;
                        }
                        _ => {}
                    }
                }

                Some(text) = rx.recv() => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break ConnectionEnd::Closed;
                    }
                }

                _ = heartbeat.tick(), if self.state == BridgeState::Registered => {
                    if send_json(&mut sink, &BridgeOutbound::Ping).await.is_err() {
                        break ConnectionEnd::Closed;
                    }
                }

                _ = drained.wait() => break ConnectionEnd::Shutdown,
            }
        };

        self.link.close();
        if matches!(end, ConnectionEnd::Shutdown) {
            // The agent has stopped; deliver what it queued on the way out
            while let Ok(text) = rx.try_recv() {
                if sink.send(Message::Text(text)).await.is_err() {
                    return end;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        }
        end
    }
}

async fn send_json(
    sink: &mut SplitSink<BridgeSocket, Message>,
    msg: &BridgeOutbound,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    sink.send(Message::Text(serde_json::to_string(msg)?)).await?;
    Ok(())
}
