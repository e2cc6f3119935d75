//! Local storage backend: redb file plus the process-wide change bus.
//!
//! The async trait methods lock and call through to [`DeckDb`]. The commit
//! lock is held across write and emit so listeners observe commit order.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;

use super::{DeckStorage, Origin, StoreEvent};
use crate::deck_db::DeckDb;
use crate::events::EventBus;
use crate::models::{now_millis, Deck, SessionResult};

pub struct LocalStore {
    db: DeckDb,
    bus: Arc<EventBus<StoreEvent>>,
    commit: Mutex<()>,
}

impl LocalStore {
    pub fn open(path: &Path, bus: Arc<EventBus<StoreEvent>>) -> Result<Self> {
        let store = Self {
            db: DeckDb::open(path)?,
            bus,
            commit: Mutex::new(()),
        };
        tracing::debug!(backend = store.backend_name(), "opened deck store at {}", path.display());
        Ok(store)
    }
}

#[async_trait]
impl DeckStorage for LocalStore {
    fn backend_name(&self) -> &str {
        "local"
    }

    fn events(&self) -> &EventBus<StoreEvent> {
        &self.bus
    }

    async fn get_all_decks(&self) -> Result<Vec<Deck>> {
        self.db.get_all_decks()
    }

    async fn get_deck(&self, id: &str) -> Result<Option<Deck>> {
        self.db.get_deck(id)
    }

    async fn save_deck(&self, mut deck: Deck, origin: Origin) -> Result<Deck> {
        let _guard = self
            .commit
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;

        // updated_at only moves forward, even if the wall clock stalls.
        let mut stamp = now_millis();
        if let Some(previous) = self.db.get_deck(&deck.id)? {
            let floor = previous.updated_at + Duration::milliseconds(1);
            if stamp < floor {
                stamp = floor;
            }
        }
        deck.updated_at = stamp;
        deck.dedupe_target_labels();

        self.db.put_deck(&deck)?;
        tracing::debug!(deck = %deck.id, ?origin, "deck saved");

        self.bus.emit(&StoreEvent::DeckUpdate {
            deck: deck.clone(),
            origin,
        });
        Ok(deck)
    }

    async fn delete_deck(&self, id: &str, origin: Origin) -> Result<()> {
        let _guard = self
            .commit
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;

        let existed = self.db.remove_deck(id)?;
        tracing::debug!(deck = %id, ?origin, existed, "deck deleted");

        self.bus.emit(&StoreEvent::DeckDelete {
            id: id.to_string(),
            origin,
        });
        Ok(())
    }

    async fn save_session(&self, result: &SessionResult) -> Result<SessionResult> {
        self.db.put_session(result)
    }

    async fn get_sessions_for_deck(&self, deck_id: &str) -> Result<Vec<SessionResult>> {
        self.db.get_sessions_for_deck(deck_id)
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionResult>> {
        self.db.get_all_sessions()
    }
}
