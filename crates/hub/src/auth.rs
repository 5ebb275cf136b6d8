//! Token signing capability.
//!
//! The hub only needs `sign(claims) -> token` and
//! `parse(token) -> claims`; [`MemorySigner`] issues opaque random tokens
//! and keeps their claims in memory.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use warden_transfer::generate_token;

/// Errors produced while issuing or checking tokens.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    Expired,

    #[error("token bound to device {token_device}, not {device}")]
    DeviceMismatch {
        token_device: String,
        device: String,
    },

    #[error("signer error: {0}")]
    Internal(String),
}

/// What a token asserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    pub role: String,
    /// Device the token was issued for; empty means any device.
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn new(username: &str, role: &str, device_id: &str, ttl: Duration) -> Self {
        Self {
            username: username.to_string(),
            role: role.to_string(),
            device_id: device_id.to_string(),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Checks expiry and, if the claims are device-bound, the device.
    pub fn check(&self, device_id: &str) -> Result<(), AuthError> {
        if self.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        if !self.device_id.is_empty() && self.device_id != device_id {
            return Err(AuthError::DeviceMismatch {
                token_device: self.device_id.clone(),
                device: device_id.to_string(),
            });
        }
        Ok(())
    }
}

pub trait TokenSigner: Send + Sync {
    fn sign(&self, claims: &Claims) -> Result<String, AuthError>;
    fn parse(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Issues opaque 64-hex tokens backed by an in-memory claims table.
#[derive(Default)]
pub struct MemorySigner {
    issued: RwLock<HashMap<String, Claims>>,
}

impl MemorySigner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenSigner for MemorySigner {
    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let token = format!("{}{}", generate_token(), generate_token());
        let mut issued = self
            .issued
            .write()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let now = Utc::now();
        issued.retain(|_, c| c.expires_at > now);
        issued.insert(token.clone(), claims.clone());
        Ok(token)
    }

    fn parse(&self, token: &str) -> Result<Claims, AuthError> {
        let issued = self
            .issued
            .read()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let claims = issued.get(token).ok_or(AuthError::InvalidToken)?;
        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        Ok(claims.clone())
    }
}
