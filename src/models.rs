//! Deck, card and session records shared by the store, cloud and peer sync.
//!
//! Field names serialize in camelCase so snapshots stay compatible with the
//! browser app's JSON. Timestamps travel as integer milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current time truncated to millisecond precision, the resolution every
/// persisted timestamp is stored at.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Kind of media a card plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Image,
    Video,
    /// A short sequence of still frames shown in rotation.
    Burst,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Image => write!(f, "image"),
            MediaType::Video => write!(f, "video"),
            MediaType::Burst => write!(f, "burst"),
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "burst" => Ok(MediaType::Burst),
            _ => Err(anyhow::anyhow!("Unknown media type: {}", s)),
        }
    }
}

/// A single stimulus: one target word plus the media that depicts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulusCard {
    pub id: String,
    pub label: String,
    /// Inline `data:` URI or remote URI. Empty after a cloud round trip.
    #[serde(default)]
    pub media_uri: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_uris: Option<Vec<String>>,
    /// Prompt that produced the media; used to regenerate it after sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_description: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl StimulusCard {
    pub fn new(label: &str, media_uri: &str, media_type: MediaType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            media_uri: media_uri.to_string(),
            media_type,
            burst_uris: None,
            original_description: None,
            created_at: now_millis(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.original_description = Some(description.to_string());
        self
    }

    pub fn has_media(&self) -> bool {
        !self.media_uri.is_empty()
    }

    /// Text fed to the media generator: the stored description, or the label
    /// when the card never had one.
    pub fn regeneration_prompt(&self) -> &str {
        match self.original_description.as_deref() {
            Some(desc) if !desc.trim().is_empty() => desc,
            _ => &self.label,
        }
    }

    /// Frames to show for this card, in order.
    ///
    /// A burst card without usable frames degrades to its primary media as a
    /// single frame. An empty result means there is nothing to draw and the
    /// caller should show the label text instead.
    pub fn display_frames(&self) -> Vec<&str> {
        if self.media_type == MediaType::Burst {
            let frames: Vec<&str> = self
                .burst_uris
                .iter()
                .flatten()
                .map(String::as_str)
                .filter(|uri| !uri.is_empty())
                .collect();
            if !frames.is_empty() {
                return frames;
            }
        }
        if self.media_uri.is_empty() {
            Vec::new()
        } else {
            vec![self.media_uri.as_str()]
        }
    }
}

/// A program: an ordered set of stimulus cards for one learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deck {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cards: Vec<StimulusCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_labels: Option<Vec<String>>,
    /// Sole basis for cloud merge ordering; stamped by the store on every save.
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_sync_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// `updated_at` of the cloud snapshot last pulled or pushed. A snapshot
    /// stamped at or before this has already been applied.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl Deck {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            cards: Vec::new(),
            target_labels: None,
            updated_at: now_millis(),
            color: None,
            cloud_sync_id: None,
            last_synced_at: None,
            remote_updated_at: None,
        }
    }

    pub fn card(&self, id: &str) -> Option<&StimulusCard> {
        self.cards.iter().find(|c| c.id == id)
    }

    /// Drop repeated target labels, keeping first occurrence order.
    pub fn dedupe_target_labels(&mut self) {
        if let Some(labels) = self.target_labels.as_mut() {
            let mut seen = std::collections::HashSet::new();
            labels.retain(|l| seen.insert(l.clone()));
        }
    }
}

/// Outcome of one completed quiz run. Never updated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    /// The deck may have been deleted since.
    pub deck_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    pub total_cards: u32,
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub duration_seconds: u64,
}
