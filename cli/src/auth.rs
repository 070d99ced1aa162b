//! Bridge credentials
//!
//! The agent never talks to the identity provider itself. The login flow
//! writes `~/.mobilecli/credentials.json`; the agent reads the current token
//! from there and, after an `auth_error`, re-reads it once in case the token
//! was refreshed out of band.

use crate::platform;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No credentials found at {0}; sign in again")]
    Missing(String),
    #[error("Could not read credentials: {0}")]
    Unreadable(String),
    #[error("Token was rejected and no newer token is available; sign in again")]
    ReauthenticationRequired,
}

/// Source of bearer tokens for the bridge handshake
pub trait TokenProvider: Send + Sync {
    /// Current token, refreshed if the provider knows it expired
    fn ensure_valid_token(&self) -> Result<String, AuthError>;

    /// Obtain a newer token after the bridge rejected the current one
    fn refresh_id_token(&self) -> Result<String, AuthError>;
}

/// Get the credentials file path (cross-platform)
pub fn credentials_file() -> PathBuf {
    platform::config_dir().join("credentials.json")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Credentials {
    id_token: String,
}

/// Tokens read from the credentials file
pub struct CredentialsFile {
    path: PathBuf,
    last_token: Mutex<Option<String>>,
}

impl CredentialsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_token: Mutex::new(None),
        }
    }

    fn read_token(&self) -> Result<String, AuthError> {
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AuthError::Missing(self.path.display().to_string())
            } else {
                AuthError::Unreadable(e.to_string())
            }
        })?;
        let creds: Credentials =
            serde_json::from_str(&data).map_err(|e| AuthError::Unreadable(e.to_string()))?;
        if creds.id_token.is_empty() {
            return Err(AuthError::Missing(self.path.display().to_string()));
        }
        Ok(creds.id_token)
    }

    fn remember(&self, token: &str) {
        if let Ok(mut last) = self.last_token.lock() {
            *last = Some(token.to_string());
        }
    }
}

impl TokenProvider for CredentialsFile {
    fn ensure_valid_token(&self) -> Result<String, AuthError> {
        let token = self.read_token()?;
        self.remember(&token);
        Ok(token)
    }

    fn refresh_id_token(&self) -> Result<String, AuthError> {
        let token = self.read_token()?;
        let unchanged = self
            .last_token
            .lock()
            .map(|last| last.as_deref() == Some(token.as_str()))
            .unwrap_or(false);
        if unchanged {
            return Err(AuthError::ReauthenticationRequired);
        }
        self.remember(&token);
        Ok(token)
    }
}

/// Fixed token, e.g. from `MOBILECLI_AGENT_TOKEN`. Cannot be refreshed.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn ensure_valid_token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }

    fn refresh_id_token(&self) -> Result<String, AuthError> {
        Err(AuthError::ReauthenticationRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_refresh_requires_a_newer_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"idToken":"t1"}"#).unwrap();

        let provider = CredentialsFile::new(&path);
        assert_eq!(provider.ensure_valid_token().unwrap(), "t1");
        assert_eq!(
            provider.refresh_id_token(),
            Err(AuthError::ReauthenticationRequired)
        );

        std::fs::write(&path, r#"{"idToken":"t2"}"#).unwrap();
        assert_eq!(provider.refresh_id_token().unwrap(), "t2");
    }

    #[test]
    fn test_missing_credentials() {
        let dir = TempDir::new().unwrap();
        let provider = CredentialsFile::new(dir.path().join("nope.json"));
        assert!(matches!(
            provider.ensure_valid_token(),
            Err(AuthError::Missing(_))
        ));
    }

    #[test]
    fn test_static_token_cannot_refresh() {
        let provider = StaticToken("abc".to_string());
        assert_eq!(provider.ensure_valid_token().unwrap(), "abc");
        assert!(provider.refresh_id_token().is_err());
    }
}
