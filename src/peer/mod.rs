//! Peer broadcast: best-effort relay of deck mutations to one directly
//! connected instance.
//!
//! ```text
//! DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED
//! ```
//!
//! Each `host`/`join` starts a fresh cycle. There is no reconnect, no ack and
//! no replay: a message in flight when the link drops is lost. Writes that
//! arrived from the peer (`Origin::Peer`) are never relayed back, which is
//! what keeps two connected peers from echoing each other forever.

pub mod ws;

pub use ws::WsTransport;

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::events::{EventBus, Subscription};
use crate::models::{now_millis, Deck};
use crate::storage::{DeckStorage, Origin, StoreEvent};

/// Wire messages, one JSON object per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    SyncDeck { deck: Deck },
    SyncDelete { id: String },
    /// Sent once on open. Informational only; never validated.
    Handshake {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub state: PeerState,
    /// Identity a peer can `join`, once hosting is registered.
    pub local_id: Option<String>,
}

/// An open connection as a pair of message channels. The incoming channel
/// closing means the connection is gone.
pub struct PeerLink {
    pub outgoing: mpsc::UnboundedSender<PeerMessage>,
    pub incoming: mpsc::UnboundedReceiver<PeerMessage>,
}

/// Resolves when the single inbound connection arrives.
pub type PendingLink = oneshot::Receiver<Result<PeerLink>>;

/// Connection establishment. Signaling and framing live behind this seam.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Register an identity and start waiting for one inbound connection.
    /// Dropping the returned [`PendingLink`] abandons the wait.
    async fn listen(&self) -> Result<(String, PendingLink)>;

    async fn connect(&self, host_id: &str) -> Result<PeerLink>;
}

struct Shared {
    state: PeerState,
    local_id: Option<String>,
    outgoing: Option<mpsc::UnboundedSender<PeerMessage>>,
    /// Bumped on every host/join/disconnect; stale links compare against it.
    generation: u64,
    host_task: Option<AbortHandle>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything a background link task needs, pinned to one generation.
#[derive(Clone)]
struct LinkContext {
    store: Arc<dyn DeckStorage>,
    shared: Arc<Mutex<Shared>>,
    status_bus: Arc<EventBus<PeerStatus>>,
    generation: u64,
}

impl LinkContext {
    fn is_current(&self) -> bool {
        lock(&self.shared).generation == self.generation
    }

    /// Transition state if this context still owns the connection.
    fn set_state(&self, state: PeerState) {
        let status = {
            let mut s = lock(&self.shared);
            if s.generation != self.generation {
                return;
            }
            s.state = state;
            if state == PeerState::Disconnected {
                s.outgoing = None;
            }
            PeerStatus {
                state,
                local_id: s.local_id.clone(),
            }
        };
        tracing::info!("peer status: {}", state);
        self.status_bus.emit(&status);
    }

    async fn run(self, link: PeerLink) {
        let PeerLink { outgoing, mut incoming } = link;
        {
            let mut s = lock(&self.shared);
            if s.generation != self.generation {
                tracing::debug!("dropping link from abandoned connection attempt");
                return;
            }
            s.outgoing = Some(outgoing.clone());
        }
        self.set_state(PeerState::Connected);

        let _ = outgoing.send(PeerMessage::Handshake {
            timestamp: now_millis(),
        });
        // Only Shared keeps the sender from here on, so disconnect() closes it.
        drop(outgoing);

        while let Some(msg) = incoming.recv().await {
            if !self.is_current() {
                break;
            }
            self.apply(msg).await;
        }
        self.set_state(PeerState::Disconnected);
    }

    async fn apply(&self, msg: PeerMessage) {
        match msg {
            PeerMessage::SyncDeck { deck } => {
                let id = deck.id.clone();
                if let Err(e) = self.store.save_deck(deck, Origin::Peer).await {
                    tracing::warn!("failed to apply peer deck {}: {:#}", id, e);
                }
            }
            PeerMessage::SyncDelete { id } => {
                if let Err(e) = self.store.delete_deck(&id, Origin::Peer).await {
                    tracing::warn!("failed to apply peer delete {}: {:#}", id, e);
                }
            }
            PeerMessage::Handshake { timestamp } => {
                tracing::debug!("peer handshake, remote clock {}", timestamp);
            }
        }
    }
}

pub struct PeerBroadcast {
    store: Arc<dyn DeckStorage>,
    transport: Arc<dyn PeerTransport>,
    shared: Arc<Mutex<Shared>>,
    status_bus: Arc<EventBus<PeerStatus>>,
    _relay: Subscription,
}

impl PeerBroadcast {
    /// Attach to `store`'s change bus. Relaying starts once a link is open and
    /// stops when this value is dropped.
    pub fn new(store: Arc<dyn DeckStorage>, transport: Arc<dyn PeerTransport>) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            state: PeerState::Disconnected,
            local_id: None,
            outgoing: None,
            generation: 0,
            host_task: None,
        }));

        let relay_shared = Arc::clone(&shared);
        let relay = store.events().subscribe(move |event: &StoreEvent| {
            if event.from_sync() {
                return;
            }
            let msg = match event {
                StoreEvent::DeckUpdate { deck, .. } => PeerMessage::SyncDeck { deck: deck.clone() },
                StoreEvent::DeckDelete { id, .. } => PeerMessage::SyncDelete { id: id.clone() },
            };
            let s = lock(&relay_shared);
            if let Some(tx) = s.outgoing.as_ref() {
                if tx.send(msg).is_err() {
                    tracing::debug!("peer link closed, relay dropped");
                }
            }
        });

        Self {
            store,
            transport,
            shared,
            status_bus: Arc::new(EventBus::new()),
            _relay: relay,
        }
    }

    pub fn status(&self) -> PeerStatus {
        let s = lock(&self.shared);
        PeerStatus {
            state: s.state,
            local_id: s.local_id.clone(),
        }
    }

    /// Notified on every status transition.
    pub fn subscribe_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PeerStatus) + Send + Sync + 'static,
    {
        self.status_bus.subscribe(callback)
    }

    /// Abandon whatever link exists and move to `state` under a new generation.
    fn reset(&self, state: PeerState) -> LinkContext {
        let (generation, status) = {
            let mut s = lock(&self.shared);
            s.generation += 1;
            s.outgoing = None;
            s.local_id = None;
            s.state = state;
            if let Some(task) = s.host_task.take() {
                task.abort();
            }
            (
                s.generation,
                PeerStatus {
                    state,
                    local_id: None,
                },
            )
        };
        tracing::info!("peer status: {}", state);
        self.status_bus.emit(&status);
        LinkContext {
            store: Arc::clone(&self.store),
            shared: Arc::clone(&self.shared),
            status_bus: Arc::clone(&self.status_bus),
            generation,
        }
    }

    /// Register with the transport and wait in the background for exactly one
    /// inbound connection. Resolves with the local identity.
    pub async fn host(&self) -> Result<String> {
        let ctx = self.reset(PeerState::Connecting);

        let (local_id, pending) = match self.transport.listen().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("peer host failed: {:#}", e);
                ctx.set_state(PeerState::Disconnected);
                return Err(e);
            }
        };

        let status = {
            let mut s = lock(&self.shared);
            if s.generation != ctx.generation {
                // Superseded while registering; the new attempt owns the state.
                return Ok(local_id);
            }
            s.local_id = Some(local_id.clone());
            PeerStatus {
                state: s.state,
                local_id: s.local_id.clone(),
            }
        };
        tracing::info!("hosting as {}", local_id);
        self.status_bus.emit(&status);

        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            match pending.await {
                Ok(Ok(link)) => task_ctx.run(link).await,
                Ok(Err(e)) => {
                    tracing::warn!("peer connection failed: {:#}", e);
                    task_ctx.set_state(PeerState::Disconnected);
                }
                Err(_) => task_ctx.set_state(PeerState::Disconnected),
            }
        });

        let mut s = lock(&self.shared);
        if s.generation == ctx.generation {
            s.host_task = Some(handle.abort_handle());
        }
        Ok(local_id)
    }

    /// Connect to a hosting peer.
    pub async fn join(&self, host_id: &str) -> Result<()> {
        let ctx = self.reset(PeerState::Connecting);

        match self.transport.connect(host_id).await {
            Ok(link) => {
                tokio::spawn(ctx.run(link));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("peer join failed: {:#}", e);
                ctx.set_state(PeerState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the current link, if any.
    pub fn disconnect(&self) {
        self.reset(PeerState::Disconnected);
    }
}

impl Drop for PeerBroadcast {
    fn drop(&mut self) {
        let mut s = lock(&self.shared);
        s.outgoing = None;
        if let Some(task) = s.host_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Two cross-wired links, as a real connection would produce.
    pub fn link_pair() -> (PeerLink, PeerLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            PeerLink { outgoing: a_tx, incoming: a_rx },
            PeerLink { outgoing: b_tx, incoming: b_rx },
        )
    }

    /// In-process transport: hosts register by id, joiners look them up.
    #[derive(Default)]
    pub struct MemoryTransport {
        hosts: Mutex<HashMap<String, oneshot::Sender<Result<PeerLink>>>>,
        next: AtomicU64,
    }

    #[async_trait]
    impl PeerTransport for MemoryTransport {
        async fn listen(&self) -> Result<(String, PendingLink)> {
            let id = format!("mem-{}", self.next.fetch_add(1, Ordering::Relaxed));
            let (tx, rx) = oneshot::channel();
            self.hosts.lock().unwrap().insert(id.clone(), tx);
            Ok((id, rx))
        }

        async fn connect(&self, host_id: &str) -> Result<PeerLink> {
            let host = self
                .hosts
                .lock()
                .unwrap()
                .remove(host_id)
                .ok_or_else(|| anyhow::anyhow!("no peer hosting as {host_id}"))?;
            let (host_side, join_side) = link_pair();
            host.send(Ok(host_side))
                .map_err(|_| anyhow::anyhow!("host {host_id} stopped listening"))?;
            Ok(join_side)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::memory::MemoryTransport;
    use super::*;
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    struct Node {
        store: Arc<LocalStore>,
        peer: PeerBroadcast,
        events: Arc<Mutex<Vec<StoreEvent>>>,
        _sub: Subscription,
        _dir: TempDir,
    }

    fn node(transport: &Arc<MemoryTransport>) -> Node {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            LocalStore::open(&dir.path().join("decks.redb"), Arc::new(EventBus::new())).unwrap(),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = store
            .events()
            .subscribe(move |e: &StoreEvent| sink.lock().unwrap().push(e.clone()));
        let transport: Arc<dyn PeerTransport> = transport.clone();
        let peer = PeerBroadcast::new(store.clone(), transport);
        Node { store, peer, events, _sub: sub, _dir: dir }
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn connected_pair() -> (Node, Node) {
        let transport = Arc::new(MemoryTransport::default());
        let a = node(&transport);
        let b = node(&transport);
        let id = a.peer.host().await.unwrap();
        b.peer.join(&id).await.unwrap();
        wait_for("both connected", || {
            a.peer.status().state == PeerState::Connected
                && b.peer.status().state == PeerState::Connected
        })
        .await;
        (a, b)
    }

    #[test]
    fn test_message_wire_format() {
        let msg = PeerMessage::SyncDelete { id: "d1".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "SYNC_DELETE");
        assert_eq!(json["id"], "d1");

        let hs: PeerMessage =
            serde_json::from_str(r#"{"kind":"HANDSHAKE","timestamp":1700000000000}"#).unwrap();
        assert!(matches!(hs, PeerMessage::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_relayed_save_is_not_echoed_back() {
        let (a, b) = connected_pair().await;

        let deck = a.store.save_deck(Deck::new("Animals", ""), Origin::Local).await.unwrap();

        wait_for("deck on peer", || !b.events.lock().unwrap().is_empty()).await;
        // Give an echo every chance to arrive.
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let b_events = b.events.lock().unwrap();
            assert_eq!(b_events.len(), 1);
            assert!(b_events[0].from_sync());
        }
        assert_eq!(a.events.lock().unwrap().len(), 1);
        assert_eq!(b.store.get_deck(&deck.id).await.unwrap().unwrap().name, "Animals");
    }

    #[tokio::test]
    async fn test_delete_relays() {
        let (a, b) = connected_pair().await;
        let deck = b.store.save_deck(Deck::new("Colors", ""), Origin::Local).await.unwrap();
        wait_for("deck on host", || a.events.lock().unwrap().len() == 1).await;

        b.store.delete_deck(&deck.id, Origin::Local).await.unwrap();
        wait_for("delete on host", || a.events.lock().unwrap().len() == 2).await;

        assert!(a.store.get_deck(&deck.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cloud_merges_are_relayed() {
        let (a, b) = connected_pair().await;
        a.store.save_deck(Deck::new("From cloud", ""), Origin::Cloud).await.unwrap();
        wait_for("cloud deck on peer", || b.events.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_no_relay_while_disconnected() {
        let transport = Arc::new(MemoryTransport::default());
        let a = node(&transport);
        a.store.save_deck(Deck::new("Solo", ""), Origin::Local).await.unwrap();
        assert_eq!(a.peer.status().state, PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_status_transitions_and_disconnect() {
        let transport = Arc::new(MemoryTransport::default());
        let a = node(&transport);
        let b = node(&transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _status = b.peer.subscribe_status(move |s| sink.lock().unwrap().push(s.state));

        let id = a.peer.host().await.unwrap();
        assert_eq!(a.peer.status().local_id.as_deref(), Some(id.as_str()));
        assert_eq!(a.peer.status().state, PeerState::Connecting);

        b.peer.join(&id).await.unwrap();
        wait_for("joiner connected", || b.peer.status().state == PeerState::Connected).await;

        a.peer.disconnect();
        wait_for("joiner dropped", || b.peer.status().state == PeerState::Disconnected).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![PeerState::Connecting, PeerState::Connected, PeerState::Disconnected]
        );
        assert!(a.peer.status().local_id.is_none());
    }

    #[tokio::test]
    async fn test_handshake_is_first_message_on_open() {
        let transport = Arc::new(MemoryTransport::default());
        let a = node(&transport);
        let id = a.peer.host().await.unwrap();
        let before = now_millis();

        let mut raw = transport.connect(&id).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), raw.incoming.recv())
            .await
            .unwrap();

        match first {
            Some(PeerMessage::Handshake { timestamp }) => {
                assert!(timestamp >= before);
                assert!(timestamp <= now_millis());
            }
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_host_accepts_a_single_peer() {
        let transport = Arc::new(MemoryTransport::default());
        let a = node(&transport);
        let b = node(&transport);
        let c = node(&transport);
        let id = a.peer.host().await.unwrap();
        b.peer.join(&id).await.unwrap();
        wait_for("first peer connected", || {
            a.peer.status().state == PeerState::Connected
                && b.peer.status().state == PeerState::Connected
        })
        .await;

        assert!(c.peer.join(&id).await.is_err());
        assert_eq!(c.peer.status().state, PeerState::Disconnected);
        assert_eq!(a.peer.status().state, PeerState::Connected);
        assert_eq!(b.peer.status().state, PeerState::Connected);

        a.store.save_deck(Deck::new("Still linked", ""), Origin::Local).await.unwrap();
        wait_for("deck on first peer", || b.events.lock().unwrap().len() == 1).await;
        assert!(c.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_unknown_host_fails_to_disconnected() {
        let transport = Arc::new(MemoryTransport::default());
        let b = node(&transport);

        assert!(b.peer.join("mem-404").await.is_err());
        assert_eq!(b.peer.status().state, PeerState::Disconnected);
    }
}
