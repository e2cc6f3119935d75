//! Storage abstraction for decks and session results.
//!
//! - [`LocalStore`]: redb-backed, the single durable source of truth
//!
//! Every deck write and delete is announced on the store's [`EventBus`]
//! after it commits, tagged with the [`Origin`] of the mutation so peers can
//! avoid echoing writes they received.

pub mod local;

pub use local::LocalStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::events::EventBus;
use crate::models::{Deck, SessionResult};

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Made on this device (UI, CLI, local push bookkeeping).
    Local,
    /// Applied from a message received over the peer channel.
    Peer,
    /// Merged from a cloud snapshot.
    Cloud,
}

impl Origin {
    /// True for writes that arrived over the peer channel. Relaying those
    /// back would bounce them between the two peers forever.
    pub fn from_sync(self) -> bool {
        matches!(self, Origin::Peer)
    }
}

/// A committed change, delivered to bus listeners in commit order.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    DeckUpdate { deck: Deck, origin: Origin },
    DeckDelete { id: String, origin: Origin },
}

impl StoreEvent {
    pub fn origin(&self) -> Origin {
        match self {
            StoreEvent::DeckUpdate { origin, .. } | StoreEvent::DeckDelete { origin, .. } => *origin,
        }
    }

    pub fn from_sync(&self) -> bool {
        self.origin().from_sync()
    }
}

/// Core storage trait for all persistent deck data.
///
/// Failures propagate to the caller; nothing is retried here.
#[async_trait]
pub trait DeckStorage: Send + Sync {
    /// Human-readable backend name (e.g., "local").
    fn backend_name(&self) -> &str;

    /// Change bus. Listeners run synchronously after each commit and must not
    /// write back into the store from inside the callback.
    fn events(&self) -> &EventBus<StoreEvent>;

    // ── Decks ────────────────────────────────────────────────────────

    /// All decks, ordered by `updated_at` ascending.
    async fn get_all_decks(&self) -> Result<Vec<Deck>>;

    async fn get_deck(&self, id: &str) -> Result<Option<Deck>>;

    /// Upsert by id. Stamps `updated_at` and returns the deck as stored.
    async fn save_deck(&self, deck: Deck, origin: Origin) -> Result<Deck>;

    async fn delete_deck(&self, id: &str, origin: Origin) -> Result<()>;

    /// Decks that have been shared to the cloud at least once.
    async fn cloud_linked_decks(&self) -> Result<Vec<Deck>> {
        Ok(self
            .get_all_decks()
            .await?
            .into_iter()
            .filter(|d| d.cloud_sync_id.is_some())
            .collect())
    }

    // ── Sessions ─────────────────────────────────────────────────────

    async fn save_session(&self, result: &SessionResult) -> Result<SessionResult>;

    /// Sessions for one deck, newest first.
    async fn get_sessions_for_deck(&self, deck_id: &str) -> Result<Vec<SessionResult>>;

    /// Every session, newest first.
    async fn get_all_sessions(&self) -> Result<Vec<SessionResult>>;
}
