//! # Session Server REST Client
//!
//! The two HTTP calls the controller makes outside the signaling socket.
//!
//! ## Endpoints:
//! - `GET /api/channels/{channel_id}/participants`: roster snapshot for the preview
//! - `POST /token/refresh`: exchange the bearer token for a fresh one before connecting

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::Participant;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct ParticipantsResponse {
    #[serde(default)]
    participants: Option<Vec<Participant>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Cheap to clone; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> VoiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the channel's current members. A missing `participants` field is
    /// an empty list.
    pub async fn fetch_participants(&self, channel_id: &str, token: &str) -> VoiceResult<Vec<Participant>> {
        let url = format!(
            "{}/api/channels/{}/participants",
            self.base_url,
            urlencoding::encode(channel_id)
        );
        debug!(%url, "Fetching channel participants");

        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Participant snapshot request failed");
            return Err(VoiceError::Connection(format!(
                "Participant request returned {}",
                status
            )));
        }

        let body: ParticipantsResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Protocol(format!("Invalid participants response: {}", e)))?;
        Ok(body.participants.unwrap_or_default())
    }

    /// Exchange `token` for a fresh access token.
    ///
    /// ## Errors:
    /// Any failure, including a non-2xx status, is an authentication error;
    /// the caller never retries it.
    pub async fn refresh_token(&self, token: &str) -> VoiceResult<String> {
        let url = format!("{}/token/refresh", self.base_url);
        debug!(%url, "Refreshing access token");

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| VoiceError::Authentication(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::Authentication(format!(
                "Token refresh returned {}",
                status
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Authentication(format!("Invalid token refresh response: {}", e)))?;
        if body.access_token.trim().is_empty() {
            return Err(VoiceError::Authentication("Token refresh returned an empty token".into()));
        }
        Ok(body.access_token)
    }
}
