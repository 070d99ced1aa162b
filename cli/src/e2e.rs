//! End-to-end encryption seam
//!
//! The relay treats encryption as a black box behind [`E2eSession`]. The
//! bundled [`SharedKey`] session seals payloads with NaCl secretbox
//! (XSalsa20-Poly1305) using a key paired with the phone ahead of time; it
//! becomes ready once the phone acknowledges the announced scheme.

use crate::protocol::Fields;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_secretbox::{
    aead::{Aead, KeyInit},
    XSalsa20Poly1305,
};
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;

const SCHEME: &str = "secretbox";
const NONCE_LEN: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum E2eError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Unsupported key exchange: {0}")]
    KeyExchange(String),
}

/// Encryption collaborator consumed by the dispatcher
pub trait E2eSession: Send {
    fn is_ready(&self) -> bool;
    fn encrypt(&self, value: &Value) -> Result<String, E2eError>;
    fn decrypt(&self, payload: &str) -> Result<Value, E2eError>;
    /// Message announcing this side of the exchange, sent after authentication
    fn create_key_exchange_message(&mut self) -> Option<Fields>;
    fn handle_key_exchange(&mut self, message: &Fields) -> Result<(), E2eError>;
}

/// No encryption configured; everything travels as plain JSON
pub struct Disabled;

impl E2eSession for Disabled {
    fn is_ready(&self) -> bool {
        false
    }

    fn encrypt(&self, _value: &Value) -> Result<String, E2eError> {
        Err(E2eError::Encrypt("encryption is not configured".to_string()))
    }

    fn decrypt(&self, _payload: &str) -> Result<Value, E2eError> {
        Err(E2eError::Decrypt("encryption is not configured".to_string()))
    }

    fn create_key_exchange_message(&mut self) -> Option<Fields> {
        None
    }

    fn handle_key_exchange(&mut self, _message: &Fields) -> Result<(), E2eError> {
        Err(E2eError::KeyExchange("encryption is not configured".to_string()))
    }
}

/// Pre-shared key session
pub struct SharedKey {
    cipher: XSalsa20Poly1305,
    peer_ready: bool,
}

impl SharedKey {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(key.into()),
            peer_ready: false,
        }
    }

    /// Build from the base64 key stored in the agent config
    pub fn from_base64(encoded: &str) -> Result<Self, E2eError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| E2eError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            E2eError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(&key))
    }
}

impl E2eSession for SharedKey {
    fn is_ready(&self) -> bool {
        self.peer_ready
    }

    fn encrypt(&self, value: &Value) -> Result<String, E2eError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| E2eError::Encrypt(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = crypto_secretbox::Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| E2eError::Encrypt(e.to_string()))?;

        // nonce || ciphertext, base64
        let mut combined = nonce_bytes.to_vec();
        combined.extend(ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, payload: &str) -> Result<Value, E2eError> {
        let combined = BASE64
            .decode(payload)
            .map_err(|e| E2eError::Decrypt(e.to_string()))?;
        if combined.len() < NONCE_LEN {
            return Err(E2eError::Decrypt("ciphertext too short".to_string()));
        }

        let nonce = crypto_secretbox::Nonce::from_slice(&combined[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &combined[NONCE_LEN..])
            .map_err(|e| E2eError::Decrypt(e.to_string()))?;

        serde_json::from_slice(&plaintext).map_err(|e| E2eError::Decrypt(e.to_string()))
    }

    fn create_key_exchange_message(&mut self) -> Option<Fields> {
        // A fresh bridge connection means the phone must confirm again
        self.peer_ready = false;
        let mut body = Fields::new();
        body.insert("scheme".to_string(), Value::from(SCHEME));
        Some(body)
    }

    fn handle_key_exchange(&mut self, message: &Fields) -> Result<(), E2eError> {
        match message.get("scheme").and_then(Value::as_str) {
            Some(SCHEME) => {
                self.peer_ready = true;
                Ok(())
            }
            other => Err(E2eError::KeyExchange(format!("{:?}", other))),
        }
    }
}

/// Build the configured session
pub fn from_key(key: Option<&str>) -> Result<Box<dyn E2eSession>, E2eError> {
    match key {
        Some(key) => Ok(Box::new(SharedKey::from_base64(key)?)),
        None => Ok(Box::new(Disabled)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ack() -> Fields {
        let mut body = Fields::new();
        body.insert("scheme".to_string(), json!("secretbox"));
        body
    }

    #[test]
    fn test_ready_only_after_peer_ack() {
        let mut session = SharedKey::new(&[7u8; 32]);
        assert!(!session.is_ready());

        let announce = session.create_key_exchange_message().unwrap();
        assert_eq!(announce.get("scheme").unwrap(), "secretbox");
        assert!(!session.is_ready());

        session.handle_key_exchange(&ack()).unwrap();
        assert!(session.is_ready());

        // Reconnect resets readiness until the phone confirms again
        session.create_key_exchange_message();
        assert!(!session.is_ready());
    }

    #[test]
    fn test_sealed_payload_opens_with_same_key_only() {
        let sender = SharedKey::new(&[1u8; 32]);
        let receiver = SharedKey::new(&[1u8; 32]);
        let stranger = SharedKey::new(&[2u8; 32]);

        let value = json!({"type": "terminal_output", "data": "ls\r\n"});
        let sealed = sender.encrypt(&value).unwrap();
        assert!(!sealed.contains("terminal_output"));

        assert_eq!(receiver.decrypt(&sealed).unwrap(), value);
        assert!(stranger.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_from_base64_rejects_short_keys() {
        assert!(matches!(
            SharedKey::from_base64(&BASE64.encode([0u8; 16])),
            Err(E2eError::InvalidKey(_))
        ));
        assert!(SharedKey::from_base64(&BASE64.encode([0u8; 32])).is_ok());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let mut session = SharedKey::new(&[0u8; 32]);
        let mut body = Fields::new();
        body.insert("scheme".to_string(), json!("rot13"));
        assert!(session.handle_key_exchange(&body).is_err());
        assert!(!session.is_ready());
    }
}
