//! Session registry
//!
//! The single source of truth for live sessions: who owns each one, who is
//! watching it, and whether a stop is in progress. Only the agent event loop
//! touches it, so nothing here is locked.

use crate::local::{ConnId, LocalHandle};
use crate::protocol::{OwnerKind, SessionSummary};
use crate::supervisor::ProcessHandle;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Session-state errors, reported to whoever asked
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} is already running")]
    AlreadyRunning(String),
    #[error("Session {0} is stopping, please wait")]
    Stopping(String),
    #[error("Session {0} not found")]
    NotFound(String),
    #[error("Working directory does not exist: {0}")]
    PathNotFound(String),
    #[error("No working directory known for session {0}")]
    UnknownPath(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Connection is already bound to session {0}")]
    AlreadyBound(String),
    #[error("Failed to start assistant: {0}")]
    Spawn(String),
}

/// The exclusive owner of a session
#[derive(Debug, Clone)]
pub enum Owner {
    /// Child process spawned by the agent
    Process(ProcessHandle),
    /// Local CLI that registered the session
    Local(LocalHandle),
}

impl Owner {
    pub fn kind(&self) -> OwnerKind {
        match self {
            Owner::Process(_) => OwnerKind::Spawned,
            Owner::Local(_) => OwnerKind::Managed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Graceful terminate was sent; escalate to a kill when it fires
    ForceKill,
    /// `session_stop` was sent to a local owner; close its connection when it fires
    StopGrace,
    /// Stop is still unconfirmed; clear the stopping flags when it fires
    StopSafety,
}

/// Pending per-session timer. Dropping it cancels the task.
#[derive(Debug)]
pub struct SessionTimer {
    kind: TimerKind,
    token: u64,
    handle: JoinHandle<()>,
}

impl SessionTimer {
    /// Run `fire` after `delay` unless cancelled first
    pub fn start<F, Fut>(kind: TimerKind, token: u64, delay: Duration, fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire().await;
        });
        Self {
            kind,
            token,
            handle,
        }
    }

    #[cfg(test)]
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One live session
#[derive(Debug)]
pub struct SessionEntry {
    pub id: String,
    pub path: String,
    pub name: String,
    pub owner: Owner,
    pub viewers: BTreeMap<ConnId, LocalHandle>,
    pub started_at: DateTime<Utc>,
    /// A stop is in flight; new starts and attaches are refused
    pub stopping: bool,
    /// The next owner teardown counts as `stopped_by_user`
    pub stop_requested: bool,
    timer: Option<SessionTimer>,
}

impl SessionEntry {
    pub fn new(id: String, path: String, name: String, owner: Owner) -> Self {
        Self {
            id,
            path,
            name,
            owner,
            viewers: BTreeMap::new(),
            started_at: Utc::now(),
            stopping: false,
            stop_requested: false,
            timer: None,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let owner_kind = self.owner.kind();
        SessionSummary {
            session_id: self.id.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            started_at: self.started_at,
            owner_kind,
            source: owner_kind.source(),
        }
    }

    /// Replace the pending timer, cancelling any previous one
    pub fn arm_timer(&mut self, timer: SessionTimer) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.cancel();
        }
    }

    /// Claim the pending timer if `token` still identifies it
    pub fn take_timer(&mut self, token: u64) -> Option<TimerKind> {
        match &self.timer {
            Some(timer) if timer.token == token => self.timer.take().map(|t| t.kind),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn pending_timer(&self) -> Option<TimerKind> {
        self.timer.as_ref().map(SessionTimer::kind)
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Whether `conn_id` is the local connection that owns this session
    pub fn is_owned_by(&self, conn_id: ConnId) -> bool {
        matches!(&self.owner, Owner::Local(handle) if handle.conn_id == conn_id)
    }
}

/// Session id -> live session
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<String, SessionEntry>,
    next_token: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse ids that are live or still being stopped
    pub fn check_available(&self, session_id: &str) -> Result<(), SessionError> {
        match self.sessions.get(session_id) {
            Some(entry) if entry.stopping => Err(SessionError::Stopping(session_id.to_string())),
            Some(_) => Err(SessionError::AlreadyRunning(session_id.to_string())),
            None => Ok(()),
        }
    }

    pub fn insert(&mut self, entry: SessionEntry) -> Result<(), SessionError> {
        self.check_available(&entry.id)?;
        tracing::debug!("Registered session {} ({:?})", entry.id, entry.owner.kind());
        self.sessions.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(session_id)
    }

    #[cfg(test)]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Remove a session and cancel its pending timer
    pub fn remove(&mut self, session_id: &str) -> Option<SessionEntry> {
        let mut entry = self.sessions.remove(session_id)?;
        entry.cancel_timer();
        Some(entry)
    }

    /// Session owned by a local connection, if any
    pub fn owned_by(&self, conn_id: ConnId) -> Option<&str> {
        self.sessions
            .values()
            .find(|entry| entry.is_owned_by(conn_id))
            .map(|entry| entry.id.as_str())
    }

    /// Add a viewer. Missing and stopping sessions are refused.
    pub fn attach(
        &mut self,
        session_id: &str,
        viewer: LocalHandle,
    ) -> Result<&SessionEntry, SessionError> {
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if entry.stopping {
            return Err(SessionError::Stopping(session_id.to_string()));
        }
        entry.viewers.insert(viewer.conn_id, viewer);
        Ok(entry)
    }

    pub fn detach(&mut self, session_id: &str, conn_id: ConnId) -> bool {
        self.sessions
            .get_mut(session_id)
            .map(|entry| entry.viewers.remove(&conn_id).is_some())
            .unwrap_or(false)
    }

    /// Snapshot of the viewers, safe to iterate while the registry changes
    pub fn viewers(&self, session_id: &str) -> Vec<LocalHandle> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.viewers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Live sessions, oldest first
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.sessions.values().map(SessionEntry::summary).collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.list().into_iter().map(|s| s.session_id).collect()
    }

    pub fn next_timer_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Cancel every pending timer
    pub fn clear_timers(&mut self) {
        for entry in self.sessions.values_mut() {
            entry.cancel_timer();
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::ConnCommand;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn local(conn_id: ConnId) -> (LocalHandle, mpsc::UnboundedReceiver<ConnCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalHandle::new(conn_id, tx), rx)
    }

    fn process_entry(id: &str) -> SessionEntry {
        SessionEntry::new(
            id.to_string(),
            "/srv/api".to_string(),
            "api".to_string(),
            Owner::Process(ProcessHandle::new(4242, None)),
        )
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let mut registry = Registry::new();
        registry.insert(process_entry("s1")).unwrap();

        let err = registry.insert(process_entry("s1")).unwrap_err();
        assert_eq!(err, SessionError::AlreadyRunning("s1".to_string()));
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_stopping_session_asks_to_wait() {
        let mut registry = Registry::new();
        registry.insert(process_entry("s1")).unwrap();
        registry.get_mut("s1").unwrap().stopping = true;

        let err = registry.check_available("s1").unwrap_err();
        assert_eq!(err, SessionError::Stopping("s1".to_string()));
        assert!(err.to_string().contains("please wait"));
    }

    #[test]
    fn test_attach_missing_and_stopping() {
        let mut registry = Registry::new();
        let (viewer, _rx) = local(7);

        assert_eq!(
            registry.attach("nope", viewer.clone()).unwrap_err(),
            SessionError::NotFound("nope".to_string())
        );

        registry.insert(process_entry("s1")).unwrap();
        registry.get_mut("s1").unwrap().stopping = true;
        assert_eq!(
            registry.attach("s1", viewer).unwrap_err(),
            SessionError::Stopping("s1".to_string())
        );
        assert!(registry.viewers("s1").is_empty());
    }

    #[test]
    fn test_viewer_snapshot_and_detach() {
        let mut registry = Registry::new();
        registry.insert(process_entry("s1")).unwrap();
        let (a, _rx_a) = local(1);
        let (b, _rx_b) = local(2);
        registry.attach("s1", a).unwrap();
        registry.attach("s1", b).unwrap();

        let snapshot = registry.viewers("s1");
        assert!(registry.detach("s1", 1));
        assert!(!registry.detach("s1", 1));

        // The snapshot is unaffected by the detach
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.viewers("s1").len(), 1);
    }

    #[test]
    fn test_list_infers_owner_kind() {
        let mut registry = Registry::new();
        let (owner, _rx) = local(3);
        registry.insert(process_entry("spawned")).unwrap();
        registry
            .insert(SessionEntry::new(
                "managed".to_string(),
                "/home/me/web".to_string(),
                "web".to_string(),
                Owner::Local(owner),
            ))
            .unwrap();

        let list = registry.list();
        let kind = |id: &str| list.iter().find(|s| s.session_id == id).unwrap().owner_kind;
        assert_eq!(kind("spawned"), OwnerKind::Spawned);
        assert_eq!(kind("managed"), OwnerKind::Managed);
        assert_eq!(registry.owned_by(3), Some("managed"));
        assert_eq!(registry.owned_by(4), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_pending_timer() {
        let mut registry = Registry::new();
        registry.insert(process_entry("s1")).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let token = registry.next_timer_token();
        let timer = SessionTimer::start(TimerKind::ForceKill, token, Duration::from_secs(5), move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        registry.get_mut("s1").unwrap().arm_timer(timer);

        registry.remove("s1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stale_timer_token_is_ignored() {
        let mut registry = Registry::new();
        registry.insert(process_entry("s1")).unwrap();

        let first = registry.next_timer_token();
        let second = registry.next_timer_token();
        let entry = registry.get_mut("s1").unwrap();
        entry.arm_timer(SessionTimer::start(TimerKind::ForceKill, first, Duration::from_secs(60), || async {}));
        entry.arm_timer(SessionTimer::start(TimerKind::StopSafety, second, Duration::from_secs(60), || async {}));

        assert_eq!(entry.take_timer(first), None);
        assert_eq!(entry.pending_timer(), Some(TimerKind::StopSafety));
        assert_eq!(entry.take_timer(second), Some(TimerKind::StopSafety));
        assert_eq!(entry.pending_timer(), None);
    }
}
