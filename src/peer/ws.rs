//! WebSocket peer transport.
//!
//! The host binds a TCP listener and its identity is the `ws://host:port`
//! URL a joiner dials. Frames are JSON-encoded [`PeerMessage`] text.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};

use super::{PeerLink, PeerMessage, PeerTransport, PendingLink};

pub struct WsTransport {
    bind_addr: String,
    /// Host name put into the local id instead of the bound address.
    advertise_host: Option<String>,
}

impl WsTransport {
    pub fn new(bind_addr: &str, advertise_host: Option<String>) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            advertise_host,
        }
    }

    fn local_id(&self, addr: SocketAddr) -> String {
        match &self.advertise_host {
            Some(host) => format!("ws://{}:{}", host, addr.port()),
            None if addr.ip().is_unspecified() => format!("ws://127.0.0.1:{}", addr.port()),
            None => format!("ws://{}", addr),
        }
    }
}

fn peer_url(host_id: &str) -> String {
    if host_id.starts_with("ws://") || host_id.starts_with("wss://") {
        host_id.to_string()
    } else {
        format!("ws://{host_id}")
    }
}

/// Pump a WebSocket into a pair of message channels.
fn bridge<S>(ws: WebSocketStream<S>) -> PeerLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<PeerMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<PeerMessage>();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("failed to encode peer message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<PeerMessage>(text.as_str()) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("ignoring malformed peer message: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("peer connection error: {}", e);
                    break;
                }
            }
        }
    });

    PeerLink {
        outgoing: out_tx,
        incoming: in_rx,
    }
}

#[async_trait]
impl PeerTransport for WsTransport {
    async fn listen(&self) -> Result<(String, PendingLink)> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("failed to bind peer listener on {}", self.bind_addr))?;
        let addr = listener.local_addr()?;
        let local_id = self.local_id(addr);

        let (mut tx, rx) = oneshot::channel::<Result<PeerLink>>();
        tokio::spawn(async move {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = tx.closed() => {
                    tracing::debug!("peer listener on {} abandoned", addr);
                    return;
                }
            };
            // One connection per host cycle.
            drop(listener);
            let result = match accepted {
                Ok((stream, remote)) => {
                    tracing::info!("peer connection from {}", remote);
                    accept_async(stream)
                        .await
                        .map(bridge)
                        .context("WebSocket handshake with peer failed")
                }
                Err(e) => Err(anyhow::Error::new(e).context("failed to accept peer connection")),
            };
            let _ = tx.send(result);
        });

        Ok((local_id, rx))
    }

    async fn connect(&self, host_id: &str) -> Result<PeerLink> {
        let url = peer_url(host_id);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to peer {url}"))?;
        tracing::info!("connected to peer {}", url);
        Ok(bridge(ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_url_normalization() {
        assert_eq!(peer_url("10.0.0.2:9000"), "ws://10.0.0.2:9000");
        assert_eq!(peer_url("ws://host:1"), "ws://host:1");
        assert_eq!(peer_url("wss://host:1"), "wss://host:1");
    }

    #[test]
    fn test_local_id_for_unspecified_bind() {
        let transport = WsTransport::new("0.0.0.0:0", None);
        let addr: SocketAddr = "0.0.0.0:4321".parse().unwrap();
        assert_eq!(transport.local_id(addr), "ws://127.0.0.1:4321");

        let advertised = WsTransport::new("0.0.0.0:0", Some("tablet.local".into()));
        assert_eq!(advertised.local_id(addr), "ws://tablet.local:4321");
    }

    #[tokio::test]
    async fn test_loopback_link_carries_messages() {
        let transport = WsTransport::new("127.0.0.1:0", None);
        let (id, pending) = transport.listen().await.unwrap();

        let mut joiner = transport.connect(&id).await.unwrap();
        let mut host = pending.await.unwrap().unwrap();

        joiner
            .outgoing
            .send(PeerMessage::SyncDelete { id: "d1".into() })
            .unwrap();
        assert_eq!(
            host.incoming.recv().await,
            Some(PeerMessage::SyncDelete { id: "d1".into() })
        );

        drop(host.outgoing);
        assert_eq!(joiner.incoming.recv().await, None);
    }
}
