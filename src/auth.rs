//! # Token Store
//!
//! Holds the bearer token used for REST calls and the signaling URL. The token
//! is replaced after every successful refresh and whenever the server pushes a
//! `token_refresh` message; with a `token_path` configured the new value is
//! written back to disk so the next run starts from it.

use crate::config::AuthConfig;
use crate::error::{VoiceError, VoiceResult};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TokenStore {
    token: String,
    path: Option<PathBuf>,
}

impl TokenStore {
    pub fn in_memory(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            path: None,
        }
    }

    /// Read the token from a file. Surrounding whitespace is ignored.
    pub fn load(path: impl Into<PathBuf>) -> VoiceResult<Self> {
        let path = path.into();
        let token = fs::read_to_string(&path)
            .map_err(|e| VoiceError::Config(format!("Cannot read token file {}: {}", path.display(), e)))?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(VoiceError::Config(format!("Token file {} is empty", path.display())));
        }
        debug!(path = %path.display(), "Loaded bearer token");
        Ok(Self { token, path: Some(path) })
    }

    /// Token file from config first, then the `fallback` value (typically `VOICE_TOKEN`).
    pub fn from_config(auth: &AuthConfig, fallback: Option<String>) -> VoiceResult<Self> {
        if let Some(path) = auth.token_path.as_deref() {
            return Self::load(path);
        }
        match fallback.filter(|t| !t.trim().is_empty()) {
            Some(token) => Ok(Self::in_memory(token.trim())),
            None => Err(VoiceError::Config(
                "No bearer token: set auth.token_path or VOICE_TOKEN".to_string(),
            )),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Replace the token, persisting it if the store is file-backed.
    ///
    /// The in-memory value is updated even when the write fails.
    pub fn replace(&mut self, token: impl Into<String>) -> VoiceResult<()> {
        self.token = token.into();
        if let Some(path) = &self.path {
            if let Err(e) = fs::write(path, &self.token) {
                warn!(path = %path.display(), "Failed to persist refreshed token: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}
