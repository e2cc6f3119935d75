//! Local-first storage and sync for visual learning decks.
//!
//! - [`storage`]: redb-backed deck/session store with a change bus
//! - [`cloud`]: media-stripped snapshots on a keyless JSON host
//! - [`peer`]: direct relay of deck mutations to one connected peer
//! - [`sync`]: cloud reconciliation and media regeneration

pub mod cloud;
pub mod config;
pub mod deck_db;
pub mod events;
pub mod media;
pub mod models;
pub mod peer;
pub mod quiz;
pub mod storage;
pub mod sync;
