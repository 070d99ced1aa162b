//! Session history
//!
//! Remembers where recently ended sessions lived so a later `resume_session`
//! without a path can find its working directory again. The store is bounded
//! both by entry count and by age, and every insertion is written through to
//! disk.

use crate::platform;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;

/// Maximum number of remembered sessions
pub const MAX_HISTORY_ENTRIES: usize = 50;

/// Entries older than this are dropped on load
pub const HISTORY_MAX_AGE_DAYS: i64 = 30;

/// One ended session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub session_id: String,
    pub path: String,
    pub name: String,
    pub ended_at: DateTime<Utc>,
}

/// Get the history file path (cross-platform)
pub fn history_file() -> PathBuf {
    platform::config_dir().join("session-history.json")
}

/// Bounded, write-through record of ended sessions.
///
/// Entries are kept in insertion order; re-recording an id moves it to the
/// newest position.
#[derive(Debug)]
pub struct SessionHistoryStore {
    path: PathBuf,
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl SessionHistoryStore {
    /// Load the store from `path`, dropping entries past the age cutoff.
    ///
    /// A missing or unreadable file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self::load_at(path, MAX_HISTORY_ENTRIES, Utc::now())
    }

    pub fn load_at(path: impl Into<PathBuf>, capacity: usize, now: DateTime<Utc>) -> Self {
        let path = path.into();
        let cutoff = now - Duration::days(HISTORY_MAX_AGE_DAYS);

        let mut entries: Vec<HistoryEntry> = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable session history {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read session history {}: {}", path.display(), e);
                Vec::new()
            }
        };

        let before = entries.len();
        entries.retain(|e| e.ended_at >= cutoff);
        if entries.len() < before {
            tracing::debug!("Dropped {} expired history entries", before - entries.len());
        }

        // Keep only the newest `capacity` entries if the file was written by a
        // build with a larger bound.
        let excess = entries.len().saturating_sub(capacity);
        let entries: VecDeque<HistoryEntry> = entries.into_iter().skip(excess).collect();

        Self {
            path,
            entries,
            capacity: capacity.max(1),
        }
    }

    /// Record that a session ended now.
    pub fn record(&mut self, session_id: &str, path: &str, name: &str) -> io::Result<()> {
        self.record_at(session_id, path, name, Utc::now())
    }

    pub fn record_at(
        &mut self,
        session_id: &str,
        path: &str,
        name: &str,
        ended_at: DateTime<Utc>,
    ) -> io::Result<()> {
        self.entries.retain(|e| e.session_id != session_id);
        while self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::debug!("Evicting oldest history entry {}", evicted.session_id);
            }
        }
        self.entries.push_back(HistoryEntry {
            session_id: session_id.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            ended_at,
        });
        self.save()
    }

    /// Find the last known location of a session
    pub fn lookup(&self, session_id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.session_id == session_id)
    }

    /// Entries from oldest to newest
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn save(&self) -> io::Result<()> {
        let data = serde_json::to_string_pretty(&self.entries)?;
        platform::write_private(&self.path, data.as_bytes())
    }
}
