//! Media generation collaborator.
//!
//! The generative backend is external; the sync orchestrator only sees the
//! [`MediaGenerator`] trait and treats every call as best-effort.
//! [`PlaceholderMedia`] is the offline implementation: it renders the prompt
//! text into an inline SVG so a regenerated card is never blank. It has no
//! video support and reports [`MediaError::Unavailable`] for it.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on results from [`MediaGenerator::generate_variations`].
pub const MAX_VARIATIONS: usize = 5;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("media generation unavailable: {0}")]
    Unavailable(String),

    #[error("media generation failed: {0}")]
    Generation(String),
}

/// What a set of variations should vary over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariationMode {
    /// Same concept, different exemplars (a red apple, a green apple, ...).
    Generalization,
    /// Successive moments of one action, used for burst cards.
    Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub media_uri: String,
    pub description: String,
}

#[async_trait]
pub trait MediaGenerator: Send + Sync {
    /// Still image for `description`. `Ok(None)` means the backend produced
    /// nothing usable.
    async fn generate_image(&self, description: &str, style: &str)
        -> Result<Option<String>, MediaError>;

    async fn generate_video(&self, description: &str) -> Result<Option<String>, MediaError>;

    /// Up to [`MAX_VARIATIONS`] related images.
    async fn generate_variations(
        &self,
        label: &str,
        style: &str,
        mode: VariationMode,
    ) -> Result<Vec<Variation>, MediaError>;
}

/// Text-on-card SVG renderer.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderMedia;

impl PlaceholderMedia {
    fn escape(text: &str) -> String {
        text.chars()
            .map(|c| match c {
                '&' => "&amp;".to_string(),
                '<' => "&lt;".to_string(),
                '>' => "&gt;".to_string(),
                '"' => "&quot;".to_string(),
                '\'' => "&apos;".to_string(),
                c => c.to_string(),
            })
            .collect()
    }

    /// Deterministic data URI for `text`; identical input gives identical output.
    pub fn render(text: &str, style: &str) -> String {
        let svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"512\" height=\"512\" data-style=\"{}\">\
             <rect width=\"100%\" height=\"100%\" fill=\"#f4f1ea\"/>\
             <text x=\"50%\" y=\"50%\" font-size=\"40\" text-anchor=\"middle\" \
             dominant-baseline=\"middle\">{}</text></svg>",
            Self::escape(style),
            Self::escape(text)
        );
        format!(
            "data:image/svg+xml;base64,{}",
            general_purpose::STANDARD.encode(svg.as_bytes())
        )
    }
}

#[async_trait]
impl MediaGenerator for PlaceholderMedia {
    async fn generate_image(
        &self,
        description: &str,
        style: &str,
    ) -> Result<Option<String>, MediaError> {
        if description.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::render(description, style)))
    }

    async fn generate_video(&self, _description: &str) -> Result<Option<String>, MediaError> {
        Err(MediaError::Unavailable("placeholder backend renders no video".into()))
    }

    async fn generate_variations(
        &self,
        label: &str,
        style: &str,
        mode: VariationMode,
    ) -> Result<Vec<Variation>, MediaError> {
        if label.trim().is_empty() {
            return Ok(Vec::new());
        }
        let descriptions: Vec<String> = match mode {
            VariationMode::Generalization => ["a", "another", "a small", "a large", "a different"]
                .iter()
                .map(|prefix| format!("{prefix} {label}"))
                .collect(),
            VariationMode::Action => (1..=MAX_VARIATIONS)
                .map(|step| format!("{label} (step {step})"))
                .collect(),
        };
        Ok(descriptions
            .into_iter()
            .take(MAX_VARIATIONS)
            .map(|description| Variation {
                media_uri: Self::render(&description, style),
                description,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(uri: &str) -> String {
        let payload = uri.strip_prefix("data:image/svg+xml;base64,").unwrap();
        String::from_utf8(general_purpose::STANDARD.decode(payload).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_image_is_deterministic_and_escaped() {
        let media = PlaceholderMedia;
        let a = media.generate_image("cats & <dogs>", "photo").await.unwrap().unwrap();
        let b = media.generate_image("cats & <dogs>", "photo").await.unwrap().unwrap();

        assert_eq!(a, b);
        let svg = decode(&a);
        assert!(svg.contains("cats &amp; &lt;dogs&gt;"));
    }

    #[tokio::test]
    async fn test_blank_description_and_video_yield_nothing() {
        let media = PlaceholderMedia;
        assert!(media.generate_image("  ", "photo").await.unwrap().is_none());
        assert!(matches!(
            media.generate_video("a dog running").await,
            Err(MediaError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_variations_capped() {
        let media = PlaceholderMedia;
        for mode in [VariationMode::Generalization, VariationMode::Action] {
            let vars = media.generate_variations("jump", "cartoon", mode).await.unwrap();
            assert_eq!(vars.len(), MAX_VARIATIONS);
            assert!(vars.iter().all(|v| v.media_uri.starts_with("data:image/svg+xml")));
        }
        let action = media
            .generate_variations("jump", "cartoon", VariationMode::Action)
            .await
            .unwrap();
        assert_eq!(action[0].description, "jump (step 1)");
    }
}
