//! Cloud reconciliation.
//!
//! Pulls remote deck snapshots into the local store and rebuilds the media
//! the snapshot host never sees. Ordering is last-write-wins on `updated_at`
//! alone: a local edit that lands after the remote write but before the next
//! scan is overwritten if the remote stamp is newer. Concurrent edits on two
//! devices are not merged.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cloud::SnapshotStore;
use crate::media::{MediaError, MediaGenerator, VariationMode, MAX_VARIATIONS};
use crate::models::{now_millis, Deck, MediaType, StimulusCard};
use crate::storage::{DeckStorage, Origin};

/// Reported after each card during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub done: usize,
    pub total: usize,
    pub label: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoSyncReport {
    pub checked: usize,
    pub pulled: usize,
    pub failed: usize,
}

pub struct SyncOrchestrator {
    store: Arc<dyn DeckStorage>,
    cloud: Arc<dyn SnapshotStore>,
    media: Arc<dyn MediaGenerator>,
    style: String,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn DeckStorage>,
        cloud: Arc<dyn SnapshotStore>,
        media: Arc<dyn MediaGenerator>,
        style: &str,
    ) -> Self {
        Self {
            store,
            cloud,
            media,
            style: style.to_string(),
        }
    }

    /// Download `cloud_id` and merge it over `existing` (if any).
    pub async fn reconcile(&self, cloud_id: &str, existing: Option<&Deck>) -> Result<Deck> {
        self.reconcile_with_progress(cloud_id, existing, |_| {}).await
    }

    pub async fn reconcile_with_progress<F>(
        &self,
        cloud_id: &str,
        existing: Option<&Deck>,
        on_progress: F,
    ) -> Result<Deck>
    where
        F: FnMut(SyncProgress) + Send,
    {
        let remote = self.cloud.download_deck(cloud_id).await?;
        self.merge_snapshot(cloud_id, remote, existing, on_progress).await
    }

    async fn merge_snapshot<F>(
        &self,
        cloud_id: &str,
        mut remote: Deck,
        existing: Option<&Deck>,
        mut on_progress: F,
    ) -> Result<Deck>
    where
        F: FnMut(SyncProgress) + Send,
    {
        let remote_stamp = remote.updated_at;
        let remote_cards = std::mem::take(&mut remote.cards);
        let total = remote_cards.len();
        let mut cards = Vec::with_capacity(total);

        // One card at a time so progress can be reported as it happens.
        for (i, mut card) in remote_cards.into_iter().enumerate() {
            let local = existing
                .and_then(|deck| deck.card(&card.id))
                .filter(|c| c.has_media());
            match local {
                Some(local) => {
                    card.media_uri = local.media_uri.clone();
                    card.burst_uris = local.burst_uris.clone();
                }
                None => self.regenerate(&mut card).await,
            }
            on_progress(SyncProgress {
                done: i + 1,
                total,
                label: card.label.clone(),
            });
            cards.push(card);
        }

        let mut merged = remote;
        merged.cards = cards;
        merged.id = match existing {
            Some(local) => local.id.clone(),
            None if !merged.id.is_empty() => merged.id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        merged.cloud_sync_id = Some(cloud_id.to_string());
        merged.last_synced_at = Some(now_millis());
        merged.remote_updated_at = Some(remote_stamp);

        let saved = self.store.save_deck(merged, Origin::Cloud).await?;
        tracing::info!(deck = %saved.id, cloud_id = %cloud_id, cards = total, "reconciled deck from cloud");
        Ok(saved)
    }

    /// Rebuild a card's media. Failures leave the card blank and are logged.
    async fn regenerate(&self, card: &mut StimulusCard) {
        let prompt = card.regeneration_prompt().to_string();
        let result = match card.media_type {
            MediaType::Image => self
                .media
                .generate_image(&prompt, &self.style)
                .await
                .map(|uri| (uri, None)),
            MediaType::Video => self.media.generate_video(&prompt).await.map(|uri| (uri, None)),
            MediaType::Burst => self.regenerate_burst(card, &prompt).await,
        };

        match result {
            Ok((Some(uri), frames)) => {
                card.media_uri = uri;
                if frames.is_some() {
                    card.burst_uris = frames;
                }
            }
            Ok((None, frames)) => {
                tracing::debug!("no media generated for card {}", card.label);
                if frames.is_some() {
                    card.burst_uris = frames;
                }
            }
            Err(MediaError::Unavailable(reason)) => {
                tracing::debug!("no {} backend for card {}: {}", card.media_type, card.label, reason)
            }
            Err(e) => tracing::warn!("media regeneration failed for card {}: {}", card.label, e),
        }
    }

    /// Action frames sized to the snapshot's frame count. Without frames the
    /// card degrades to a single still and an empty frame list.
    async fn regenerate_burst(
        &self,
        card: &StimulusCard,
        prompt: &str,
    ) -> Result<(Option<String>, Option<Vec<String>>), MediaError> {
        let wanted = card
            .burst_uris
            .as_ref()
            .map(Vec::len)
            .filter(|n| *n > 0)
            .unwrap_or(MAX_VARIATIONS)
            .min(MAX_VARIATIONS);

        let frames: Vec<String> = match self
            .media
            .generate_variations(&card.label, &self.style, VariationMode::Action)
            .await
        {
            Ok(variations) => variations
                .into_iter()
                .map(|v| v.media_uri)
                .filter(|uri| !uri.is_empty())
                .take(wanted)
                .collect(),
            Err(e) => {
                tracing::debug!("burst frames unavailable for {}: {}", card.label, e);
                Vec::new()
            }
        };

        if let Some(first) = frames.first().cloned() {
            return Ok((Some(first), Some(frames)));
        }
        let still = self.media.generate_image(prompt, &self.style).await?;
        Ok((still, Some(Vec::new())))
    }

    /// Share a deck: update its snapshot, or create one on first share.
    /// Returns the cloud id.
    pub async fn push(&self, deck_id: &str) -> Result<String> {
        let deck = self
            .store
            .get_deck(deck_id)
            .await?
            .with_context(|| format!("deck {deck_id} not found"))?;

        let cloud_id = match deck.cloud_sync_id.clone() {
            Some(id) => {
                self.cloud.update_deck(&id, &deck).await?;
                id
            }
            None => self.cloud.upload_deck(&deck).await?,
        };

        // The deck may have changed or vanished while the upload was in flight.
        match self.store.get_deck(deck_id).await? {
            Some(mut latest) => {
                latest.cloud_sync_id = Some(cloud_id.clone());
                latest.last_synced_at = Some(now_millis());
                latest.remote_updated_at = Some(deck.updated_at);
                self.store.save_deck(latest, Origin::Local).await?;
            }
            None => tracing::debug!("deck {} deleted during push", deck_id),
        }
        Ok(cloud_id)
    }

    /// One scan over every cloud-linked deck, pulling remotes whose
    /// `updated_at` is strictly newer than both the local deck and the last
    /// snapshot applied. Per-deck failures are counted, not propagated.
    pub async fn auto_sync(&self) -> Result<AutoSyncReport> {
        let decks = self.store.cloud_linked_decks().await?;
        let mut report = AutoSyncReport::default();

        for local in decks {
            let Some(cloud_id) = local.cloud_sync_id.clone() else {
                continue;
            };
            report.checked += 1;

            let remote = match self.cloud.download_deck(&cloud_id).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!("auto-sync download of {} failed: {}", cloud_id, e);
                    report.failed += 1;
                    continue;
                }
            };
            if !is_newer(&remote, &local) {
                continue;
            }

            // Re-read after the download: the store may have moved on.
            let current = match self.store.get_deck(&local.id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    tracing::debug!("deck {} deleted during auto-sync", local.id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("auto-sync could not reload {}: {:#}", local.id, e);
                    report.failed += 1;
                    continue;
                }
            };
            if !is_newer(&remote, &current) {
                continue;
            }

            match self.merge_snapshot(&cloud_id, remote, Some(&current), |_| {}).await {
                Ok(_) => report.pulled += 1,
                Err(e) => {
                    tracing::warn!("auto-sync merge of {} failed: {:#}", cloud_id, e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            pulled = report.pulled,
            failed = report.failed,
            "auto-sync finished"
        );
        Ok(report)
    }

    /// Run [`auto_sync`](Self::auto_sync) every `every` until the handle is
    /// aborted.
    pub fn spawn_auto_sync(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.auto_sync().await {
                    tracing::warn!("auto-sync scan failed: {:#}", e);
                }
            }
        })
    }
}

/// True when `remote` is strictly newer than `local` and than the snapshot
/// last applied to it.
fn is_newer(remote: &Deck, local: &Deck) -> bool {
    remote.updated_at > local.updated_at
        && local
            .remote_updated_at
            .map_or(true, |applied| remote.updated_at > applied)
}
