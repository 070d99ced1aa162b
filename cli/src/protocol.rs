//! WebSocket protocol messages
//!
//! Two planes share the same JSON shape (`type` tag in snake_case, camelCase
//! fields):
//! - bridge plane: agent <-> cloud relay
//! - local plane: agent <-> CLI instances on this host

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque event body forwarded without interpretation
pub type Fields = Map<String, Value>;

/// Messages received from the bridge
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeInbound {
    /// Token accepted, agent may register
    #[serde(alias = "auth_success")]
    Authenticated {
        user_id: Option<String>,
    },
    AuthError {
        message: Option<String>,
    },
    StartSession {
        session_id: Option<String>,
        path: String,
        name: Option<String>,
        prompt: Option<String>,
        request_id: String,
    },
    ResumeSession {
        session_id: String,
        path: Option<String>,
        name: Option<String>,
        request_id: String,
    },
    StopSession {
        session_id: String,
        request_id: String,
    },
    ListAgentSessions {
        request_id: Option<String>,
    },
    /// Raw keystrokes from the phone
    TerminalInput {
        session_id: String,
        data: String,
    },
    /// Chat-style prompt from the phone
    SendMessage {
        session_id: String,
        content: String,
    },
    PermissionResponse {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    KeyExchange {
        #[serde(flatten)]
        body: Fields,
    },
    /// E2E-encrypted bridge message, decrypts to another `BridgeInbound`
    Encrypted {
        payload: String,
    },
    Ping,
    Pong,
    Error {
        message: Option<String>,
    },
}

/// Messages sent to the bridge
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeOutbound {
    Authenticate {
        token: String,
    },
    AgentRegister {
        agent_id: String,
        host_name: String,
        platform: String,
        active_sessions: Vec<String>,
    },
    RegisterSession {
        session_id: String,
        path: String,
        name: String,
        /// `None` until the agent itself is registered with the bridge
        agent_id: Option<String>,
        agent_host_name: String,
    },
    AgentSessionStarted {
        request_id: String,
        session_id: String,
        path: String,
        name: String,
    },
    AgentSessionResumed {
        request_id: String,
        session_id: String,
        path: String,
        name: String,
    },
    AgentSessionStopping {
        request_id: String,
        session_id: String,
    },
    AgentSessionEnded {
        session_id: String,
        reason: EndReason,
        exit_code: Option<i32>,
    },
    AgentSessionError {
        request_id: Option<String>,
        session_id: Option<String>,
        error: String,
    },
    AgentSessions {
        request_id: Option<String>,
        sessions: Vec<SessionSummary>,
    },
    TerminalOutput {
        session_id: String,
        data: String,
    },
    ClaudeMessage {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    PermissionRequest {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    SessionStatus {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    KeyExchange {
        #[serde(flatten)]
        body: Fields,
    },
    /// Session-scoped event sealed by the E2E module
    Encrypted {
        session_id: String,
        payload: String,
    },
    Ping,
    Pong,
}

/// Messages sent from a local CLI to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LocalInbound {
    Authenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    RegisterSession {
        session_id: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    AttachSession {
        session_id: String,
    },
    ListSessions,
    TerminalInput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: String,
    },
    TerminalOutput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: String,
    },
    ClaudeMessage {
        #[serde(flatten)]
        body: Fields,
    },
    PermissionRequest {
        #[serde(flatten)]
        body: Fields,
    },
    SessionStatus {
        #[serde(flatten)]
        body: Fields,
    },
    Ping,
}

/// Messages sent from the agent to a local CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LocalOutbound {
    AuthSuccess,
    Registered {
        session_id: String,
    },
    RegisterError {
        session_id: String,
        error: String,
    },
    AttachSuccess {
        session_id: String,
        name: String,
        path: String,
    },
    AttachError {
        session_id: String,
        error: String,
    },
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    /// Input for the owner to feed its terminal
    TerminalInput {
        session_id: String,
        data: String,
    },
    TerminalOutput {
        session_id: String,
        data: String,
    },
    ClaudeMessage {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    PermissionRequest {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    SessionStatus {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    UserMessage {
        session_id: String,
        content: String,
    },
    PermissionResponse {
        session_id: String,
        #[serde(flatten)]
        body: Fields,
    },
    /// Asks the owner to exit without triggering its own reconnect logic
    SessionStop {
        session_id: String,
        reason: String,
    },
    SessionEnded {
        session_id: String,
        reason: EndReason,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    BridgeDisconnected,
    BridgeReconnected,
    Error {
        message: String,
    },
    Pong,
}

/// Why a session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    StoppedByUser,
    Disconnected,
    Exited,
    Error,
    Shutdown,
}

/// Who owns a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    /// The agent spawned the child process
    Spawned,
    /// A local CLI registered itself
    Managed,
}

/// Where a session was started from, as shown in the phone app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Ios,
    Cli,
}

impl OwnerKind {
    pub fn source(self) -> SessionSource {
        match self {
            OwnerKind::Spawned => SessionSource::Ios,
            OwnerKind::Managed => SessionSource::Cli,
        }
    }
}

/// Session list item for `list_sessions` / `list_agent_sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub name: String,
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub owner_kind: OwnerKind,
    pub source: SessionSource,
}

/// Drop keys that the envelope already carries so forwarding does not
/// duplicate them.
pub fn strip_envelope(mut body: Fields) -> Fields {
    body.remove("type");
    body.remove("sessionId");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_session_uses_camel_case_fields() {
        let json = r#"{"type":"start_session","path":"~/code","name":"api","prompt":"fix it","requestId":"r1"}"#;
        match serde_json::from_str::<BridgeInbound>(json).unwrap() {
            BridgeInbound::StartSession {
                session_id,
                path,
                request_id,
                ..
            } => {
                assert!(session_id.is_none());
                assert_eq!(path, "~/code");
                assert_eq!(request_id, "r1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"type":"reticulate_splines","sessionId":"s1"}"#;
        assert!(serde_json::from_str::<BridgeInbound>(json).is_err());
        assert!(serde_json::from_str::<LocalInbound>(json).is_err());
    }

    #[test]
    fn test_auth_success_alias() {
        let msg: BridgeInbound = serde_json::from_str(r#"{"type":"auth_success"}"#).unwrap();
        assert!(matches!(msg, BridgeInbound::Authenticated { .. }));
    }

    #[test]
    fn test_agent_register_wire_shape() {
        let msg = BridgeOutbound::AgentRegister {
            agent_id: "a1".to_string(),
            host_name: "devbox".to_string(),
            platform: "linux".to_string(),
            active_sessions: vec!["s1".to_string()],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "agent_register");
        assert_eq!(value["agentId"], "a1");
        assert_eq!(value["hostName"], "devbox");
        assert_eq!(value["activeSessions"][0], "s1");
    }

    #[test]
    fn test_register_session_sends_null_agent_id() {
        let msg = BridgeOutbound::RegisterSession {
            session_id: "s1".to_string(),
            path: "/tmp".to_string(),
            name: "tmp".to_string(),
            agent_id: None,
            agent_host_name: "devbox".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value["agentId"].is_null());
        assert_eq!(value["agentHostName"], "devbox");
    }

    #[test]
    fn test_claude_message_keeps_opaque_fields() {
        let json = r#"{"type":"claude_message","sessionId":"s1","role":"assistant","content":"hi"}"#;
        let LocalInbound::ClaudeMessage { body } = serde_json::from_str(json).unwrap() else {
            panic!("expected claude_message");
        };
        let body = strip_envelope(body);
        assert_eq!(body.get("role").unwrap(), "assistant");
        assert!(body.get("sessionId").is_none());

        let out = LocalOutbound::ClaudeMessage {
            session_id: "s1".to_string(),
            body,
        };
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["type"], "claude_message");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn test_session_summary_reports_owner_and_source() {
        let summary = SessionSummary {
            session_id: "s1".to_string(),
            name: "api".to_string(),
            path: "/srv/api".to_string(),
            started_at: Utc::now(),
            owner_kind: OwnerKind::Spawned,
            source: OwnerKind::Spawned.source(),
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["ownerKind"], "spawned");
        assert_eq!(value["source"], "ios");
        assert!(value["startedAt"].is_string());
    }
}
