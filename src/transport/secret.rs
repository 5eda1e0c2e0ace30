//! Single-use secrets binding a channel to a session.

use crate::error::{MigrationError, Result};
use crate::transport::channel::ChannelKind;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Random bytes per secret (hex-encoded to 64 characters)
pub const SECRET_BYTES: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Generate a fresh secret from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut buf = [0u8; SECRET_BYTES];
        OsRng.try_fill_bytes(&mut buf).map_err(|e| {
            MigrationError::Validation(format!("Failed to generate migration secret: {}", e))
        })?;
        Ok(Self(hex::encode(buf)))
    }

    /// Wrap a secret handed out by the control plane.
    pub fn from_token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(MigrationError::Validation("Empty migration secret".to_string()));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digest(&self) -> [u8; 32] {
        digest(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

fn digest(token: &str) -> [u8; 32] {
    *blake3::hash(token.as_bytes()).as_bytes()
}

/// Secrets issued for one session, keyed by digest. Each secret is removed
/// on its first successful use.
#[derive(Default)]
pub struct SecretRegistry {
    pending: Mutex<HashMap<[u8; 32], ChannelKind>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, secret: &Secret, kind: ChannelKind) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(secret.digest(), kind);
        }
    }

    /// Consume `token`, returning the channel it was issued for.
    pub fn consume(&self, token: &str) -> Result<ChannelKind> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| MigrationError::Auth("Secret registry poisoned".to_string()))?;
        pending
            .remove(&digest(token))
            .ok_or_else(|| MigrationError::Auth("Unknown or already used secret".to_string()))
    }

    pub fn remaining(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_generate_is_unique() {
        let a = Secret::generate().unwrap();
        let b = Secret::generate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), SECRET_BYTES * 2);
    }

    #[test]
    fn test_debug_redacts() {
        let s = Secret::generate().unwrap();
        assert!(!format!("{:?}", s).contains(s.as_str()));
    }

    #[test]
    fn test_consume_once() {
        let registry = SecretRegistry::new();
        let secret = Secret::generate().unwrap();
        registry.register(&secret, ChannelKind::Fs);

        assert_eq!(registry.consume(secret.as_str()).unwrap(), ChannelKind::Fs);
        let err = registry.consume(secret.as_str()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(registry.remaining(), 0);
    }

    #[test]
    fn test_unknown_secret() {
        let registry = SecretRegistry::new();
        registry.register(&Secret::generate().unwrap(), ChannelKind::Control);
        assert!(registry.consume("nope").is_err());
        assert_eq!(registry.remaining(), 1);
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(Secret::from_token("").is_err());
    }
}
