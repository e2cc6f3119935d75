//! Cloud snapshot sync against a public, keyless JSON-blob host.
//!
//! ```text
//! POST {base}        body = stripped deck   → { "id": "..." }
//! POST {base}/{id}   body = stripped deck   → 2xx
//! GET  {base}/{id}                          → deck JSON
//! ```
//!
//! Media payloads never leave the device: [`strip_media`] blanks them and the
//! receiving side regenerates visuals from each card's description.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client as HttpClient, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::models::Deck;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("cloud request failed: {0}")]
    Transport(String),

    #[error("cloud deck {id} not found (HTTP {status})")]
    NotFound { id: String, status: u16 },

    #[error("cloud response could not be decoded: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CloudError {
    fn from(error: reqwest::Error) -> Self {
        CloudError::Transport(error.to_string())
    }
}

/// Copy of `deck` with every media payload removed. Labels, descriptions,
/// media types and the number of burst frames are kept.
pub fn strip_media(deck: &Deck) -> Deck {
    let mut stripped = deck.clone();
    for card in &mut stripped.cards {
        card.media_uri.clear();
        if let Some(frames) = card.burst_uris.as_mut() {
            frames.iter_mut().for_each(String::clear);
        }
    }
    stripped
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Create a new remote snapshot and return the id the host assigned.
    async fn upload_deck(&self, deck: &Deck) -> Result<String, CloudError>;

    /// Overwrite the snapshot at `id`.
    async fn update_deck(&self, id: &str, deck: &Deck) -> Result<(), CloudError>;

    async fn download_deck(&self, id: &str) -> Result<Deck, CloudError>;
}

/// HTTP client for the JSON-blob host.
pub struct JsonBinClient {
    base_url: String,
    http_client: HttpClient,
}

impl JsonBinClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CloudError> {
        let http_client = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/{}", self.base_url, id)
    }

    fn id_from_body(body: &str) -> Option<String> {
        let value: Value = serde_json::from_str(body).ok()?;
        match value.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn id_from_location(location: &str) -> Option<String> {
        location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl SnapshotStore for JsonBinClient {
    async fn upload_deck(&self, deck: &Deck) -> Result<String, CloudError> {
        let resp = self
            .http_client
            .post(&self.base_url)
            .header(header::ACCEPT, "application/json")
            .json(&strip_media(deck))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CloudError::Transport(format!("upload failed with status: {status}")));
        }

        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;

        let id = Self::id_from_body(&body)
            .or_else(|| location.as_deref().and_then(Self::id_from_location))
            .ok_or_else(|| CloudError::Transport("upload response did not include an id".into()))?;
        tracing::info!(deck = %deck.id, cloud_id = %id, "uploaded deck snapshot");
        Ok(id)
    }

    async fn update_deck(&self, id: &str, deck: &Deck) -> Result<(), CloudError> {
        let resp = self
            .http_client
            .post(self.record_url(id))
            .header(header::ACCEPT, "application/json")
            .json(&strip_media(deck))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CloudError::Transport(format!("update of {id} failed with status: {status}")));
        }
        tracing::info!(deck = %deck.id, cloud_id = %id, "updated deck snapshot");
        Ok(())
    }

    async fn download_deck(&self, id: &str) -> Result<Deck, CloudError> {
        let resp = self
            .http_client
            .get(self.record_url(id))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CloudError::NotFound {
                id: id.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.text().await?;
        let deck: Deck =
            serde_json::from_str(&body).map_err(|e| CloudError::Decode(e.to_string()))?;
        tracing::debug!(cloud_id = %id, cards = deck.cards.len(), "downloaded deck snapshot");
        Ok(deck)
    }
}

/// True when the host says the record is gone, as opposed to a download
/// that failed for some other status.
pub fn is_not_found(error: &CloudError) -> bool {
    matches!(error, CloudError::NotFound { status, .. } if *status == StatusCode::NOT_FOUND.as_u16() || *status == StatusCode::GONE.as_u16())
}
