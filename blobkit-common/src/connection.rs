//! Provider-agnostic connection info.
//!
//! A backend describes itself as `{ "type": ..., "config": {...} }`. The
//! token form is the URL-safe base64 (no padding) of that JSON document.
//!
//! The config carries the credentials needed to reconnect, including the
//! secret key. Base64 is an encoding, not encryption: treat tokens like the
//! key itself and never log them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "type")]
    pub backend_type: String,
    pub config: serde_json::Value,
}

impl ConnectionInfo {
    pub fn new(backend_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            backend_type: backend_type.into(),
            config,
        }
    }

    pub fn to_token(&self) -> String {
        // Serializing a Value-backed struct cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn from_token(token: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| Error::InvalidConfiguration(format!("malformed connection token: {}", e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::InvalidConfiguration(format!("malformed connection token: {}", e)))
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("backend_type", &self.backend_type)
            .field("config", &"<redacted>")
            .finish()
    }
}
