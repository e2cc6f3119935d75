//! Deck and session persistence backed by redb.
//!
//! Four tables:
//!   decks:             deck_id                      → Deck JSON
//!   decks_by_updated:  "{updated_ms:020}:{deck_id}" → deck_id
//!   sessions:          date_ms                      → SessionResult JSON
//!   sessions_by_deck:  deck_id                      ⇒ date_ms (multimap)
//!
//! The zero-padded key keeps `decks_by_updated` iteration in timestamp order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;
use redb::{Database, MultimapTableDefinition, ReadableTable, TableDefinition};

use crate::models::{Deck, SessionResult};

const DECKS: TableDefinition<&str, &[u8]> = TableDefinition::new("decks");
const DECKS_BY_UPDATED: TableDefinition<&str, &str> = TableDefinition::new("decks_by_updated");
const SESSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("sessions");
const SESSIONS_BY_DECK: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("sessions_by_deck");

fn updated_key(deck: &Deck) -> String {
    let ms = deck.updated_at.timestamp_millis().max(0);
    format!("{:020}:{}", ms, deck.id)
}

pub struct DeckDb {
    db: Database,
}

impl DeckDb {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open deck database at {}", path.display()))?;
        // Ensure tables exist
        {
            let txn = db.begin_write()?;
            txn.open_table(DECKS)?;
            txn.open_table(DECKS_BY_UPDATED)?;
            txn.open_table(SESSIONS)?;
            txn.open_multimap_table(SESSIONS_BY_DECK)?;
            txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Default location: `<data_dir>/tactdeck/decks.redb`.
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("tactdeck");
        Ok(data_dir.join("decks.redb"))
    }

    pub fn get_deck(&self, id: &str) -> Result<Option<Deck>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DECKS)?;
        match table.get(id)? {
            Some(data) => {
                let deck: Deck =
                    serde_json::from_slice(data.value()).context("corrupt deck record in redb")?;
                Ok(Some(deck))
            }
            None => Ok(None),
        }
    }

    /// All decks, oldest `updated_at` first.
    pub fn get_all_decks(&self) -> Result<Vec<Deck>> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(DECKS_BY_UPDATED)?;
        let decks = txn.open_table(DECKS)?;
        let mut out = Vec::new();
        for entry in index.iter()? {
            let (_, id) = entry?;
            if let Some(data) = decks.get(id.value())? {
                match serde_json::from_slice::<Deck>(data.value()) {
                    Ok(deck) => out.push(deck),
                    Err(e) => tracing::warn!("skipping corrupt deck {}: {}", id.value(), e),
                }
            }
        }
        Ok(out)
    }

    /// Insert or replace a deck, moving its ordering index entry.
    pub fn put_deck(&self, deck: &Deck) -> Result<()> {
        let data = serde_json::to_vec(deck)?;
        let txn = self.db.begin_write()?;
        {
            let mut decks = txn.open_table(DECKS)?;
            let mut index = txn.open_table(DECKS_BY_UPDATED)?;

            let previous: Option<Deck> = match decks.get(deck.id.as_str())? {
                Some(old) => Some(
                    serde_json::from_slice(old.value()).context("corrupt deck record in redb")?,
                ),
                None => None,
            };
            if let Some(old) = previous {
                index.remove(updated_key(&old).as_str())?;
            }

            decks.insert(deck.id.as_str(), data.as_slice())?;
            index.insert(updated_key(deck).as_str(), deck.id.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a deck. Returns whether a record existed.
    pub fn remove_deck(&self, id: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut decks = txn.open_table(DECKS)?;
            let mut index = txn.open_table(DECKS_BY_UPDATED)?;
            let removed: Option<Deck> = match decks.remove(id)? {
                Some(old) => Some(
                    serde_json::from_slice(old.value()).context("corrupt deck record in redb")?,
                ),
                None => None,
            };
            match removed {
                Some(old) => {
                    index.remove(updated_key(&old).as_str())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(existed)
    }

    /// Store a session result keyed by its date. If another result already
    /// owns that millisecond the key is bumped forward; the stored date
    /// follows the key. Returns the result as stored.
    pub fn put_session(&self, result: &SessionResult) -> Result<SessionResult> {
        let mut stored = result.clone();
        let txn = self.db.begin_write()?;
        {
            let mut sessions = txn.open_table(SESSIONS)?;
            let mut by_deck = txn.open_multimap_table(SESSIONS_BY_DECK)?;

            let mut key = result.date.timestamp_millis().max(0) as u64;
            while sessions.get(key)?.is_some() {
                key += 1;
            }
            if let Some(date) = DateTime::from_timestamp_millis(key as i64) {
                stored.date = date;
            }

            let data = serde_json::to_vec(&stored)?;
            sessions.insert(key, data.as_slice())?;
            by_deck.insert(stored.deck_id.as_str(), key)?;
        }
        txn.commit()?;
        Ok(stored)
    }

    /// Sessions for one deck, newest first.
    pub fn get_sessions_for_deck(&self, deck_id: &str) -> Result<Vec<SessionResult>> {
        let txn = self.db.begin_read()?;
        let by_deck = txn.open_multimap_table(SESSIONS_BY_DECK)?;
        let sessions = txn.open_table(SESSIONS)?;
        let mut out = Vec::new();
        for key in by_deck.get(deck_id)? {
            let key = key?.value();
            if let Some(data) = sessions.get(key)? {
                if let Ok(result) = serde_json::from_slice::<SessionResult>(data.value()) {
                    out.push(result);
                }
            }
        }
        out.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(out)
    }

    /// Every session, newest first.
    pub fn get_all_sessions(&self) -> Result<Vec<SessionResult>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SESSIONS)?;
        let mut out = Vec::new();
        // Reverse iterate (newest first)
        for item in table.iter()?.rev() {
            let (_, val) = item?;
            if let Ok(result) = serde_json::from_slice::<SessionResult>(val.value()) {
                out.push(result);
            }
        }
        Ok(out)
    }
}
