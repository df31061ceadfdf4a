//! Core coordinator: the public `Router` handle and its actor task.
//!
//! All routing state lives on a single spawned task; the handle talks to
//! it through a bounded event channel, so handlers never need locks.
//! Queries are a synchronous rendezvous over oneshot replies. Timers for
//! tree announcements and snake maintenance are re-armed inside the actor
//! and observe the cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crypto::Crypto;
use crate::peers::LOCAL_PORT;
use crate::state::{NodeStatus, State};
use crate::types::{Addr, Error, Result};
use crate::wire::{Frame, Port};

/// Capacity of the event queue into the actor.
const EVENT_CHANNEL_SIZE: usize = 512;

/// Capacity of the local delivery queue (frames for the application).
const DELIVERY_CHANNEL_SIZE: usize = 512;

/// Events processed by the router actor, one at a time, FIFO per sender.
enum Event {
    FrameReceived {
        port: Port,
        frame: Frame,
    },
    PeerUp {
        key: Addr,
        tx: mpsc::Sender<Frame>,
        reply: oneshot::Sender<Port>,
    },
    PeerDown {
        port: Port,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
}

/// Handle to a running router actor.
pub struct Router {
    addr: Addr,
    peer_channel_size: usize,
    event_tx: mpsc::Sender<Event>,
    delivery_rx: Mutex<mpsc::Receiver<Frame>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    _actor: JoinHandle<()>,
}

/// Create a new router with the given identity and spawn its actor.
pub fn new_router(secret: SigningKey, config: Config) -> Arc<Router> {
    let crypto = Crypto::new(secret);
    let addr = crypto.addr();
    let peer_channel_size = config.peer_channel_size;
    let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let cancel = CancellationToken::new();

    let state = State::new(crypto, config, delivery_tx);
    let actor = tokio::spawn(actor_loop(state, event_rx, cancel.clone()));

    Arc::new(Router {
        addr,
        peer_channel_size,
        event_tx,
        delivery_rx: Mutex::new(delivery_rx),
        cancel,
        closed: AtomicBool::new(false),
        _actor: actor,
    })
}

async fn actor_loop(
    mut state: State,
    mut events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) {
    let mut tree_timer = tokio::time::interval(state.config.announce_interval);
    let mut snake_timer = tokio::time::interval(state.config.snake_maintain_interval);
    tree_timer.tick().await; // skip the immediate first ticks
    snake_timer.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tree_timer.tick() => state.maintain_tree(),
            _ = snake_timer.tick() => state.maintain_snake(),
            event = events.recv() => match event {
                None => break,
                Some(Event::FrameReceived { port, frame }) => {
                    if let Err(err) = state.handle_frame(port, frame) {
                        tracing::debug!(port, %err, "dropping frame");
                    }
                }
                Some(Event::PeerUp { key, tx, reply }) => {
                    let port = state.handle_peer_up(key.0, tx);
                    let _ = reply.send(port);
                }
                Some(Event::PeerDown { port }) => state.handle_peer_down(port),
                Some(Event::Status { reply }) => {
                    let _ = reply.send(state.status());
                }
            },
        }
        state.run_pending_maintenance();
    }
}

impl Router {
    /// Our public key.
    pub fn local_addr(&self) -> Addr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Stop the actor and all timers. In-flight handlers run to
    /// completion; further calls on the handle return `Error::Closed`.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::Closed);
        }
        self.cancel.cancel();
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Register a started peer link. Returns the allocated port and the
    /// outbound frame stream the link layer must drain toward the peer.
    pub async fn add_peer(&self, key: Addr) -> Result<(Port, mpsc::Receiver<Frame>)> {
        self.check_open()?;
        if key == self.addr {
            return Err(Error::BadKey);
        }
        let (tx, rx) = mpsc::channel(self.peer_channel_size);
        let (reply, response) = oneshot::channel();
        self.event_tx
            .send(Event::PeerUp { key, tx, reply })
            .await
            .map_err(|_| Error::Closed)?;
        let port = response.await.map_err(|_| Error::Closed)?;
        Ok((port, rx))
    }

    /// Drop a peer link: its announcement record goes away and every snake
    /// path over it is torn down.
    pub async fn remove_peer(&self, port: Port) -> Result<()> {
        self.check_open()?;
        self.event_tx
            .send(Event::PeerDown { port })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Hand an inbound frame from the link layer to the router.
    pub async fn frame_received(&self, port: Port, frame: Frame) -> Result<()> {
        self.check_open()?;
        self.event_tx
            .send(Event::FrameReceived { port, frame })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Originate a frame from this node, as if the application pushed it
    /// through the local port.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.frame_received(LOCAL_PORT, frame).await
    }

    /// Receive the next frame delivered to this node.
    pub async fn recv(&self) -> Result<Frame> {
        self.check_open()?;
        let mut rx = self.delivery_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            frame = rx.recv() => frame.ok_or(Error::Closed),
        }
    }

    /// Snapshot of the routing state, for diagnostics and tests.
    pub async fn status(&self) -> Result<NodeStatus> {
        self.check_open()?;
        let (reply, response) = oneshot::channel();
        self.event_tx
            .send(Event::Status { reply })
            .await
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)
    }

    /// Our current coordinates: the signed hop vector from the root.
    pub async fn coords(&self) -> Result<Vec<Port>> {
        Ok(self.status().await?.coords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn create_and_close() {
        let key = SigningKey::generate(&mut OsRng);
        let router = new_router(key, Config::default());
        assert!(!router.is_closed());

        router.close().unwrap();
        assert!(router.is_closed());
        assert!(router.close().is_err());
        assert!(router.status().await.is_err());
    }

    #[tokio::test]
    async fn lone_node_is_its_own_root() {
        let key = SigningKey::generate(&mut OsRng);
        let router = new_router(key, Config::default());

        let status = router.status().await.unwrap();
        assert_eq!(status.parent, None);
        assert_eq!(status.root, router.local_addr());
        assert!(status.coords.is_empty());
        assert_eq!(status.ascending, None);
        assert_eq!(status.descending, None);

        router.close().unwrap();
    }

    #[tokio::test]
    async fn add_peer_rejects_self() {
        let key = SigningKey::generate(&mut OsRng);
        let router = new_router(key, Config::default());
        assert!(router.add_peer(router.local_addr()).await.is_err());
        router.close().unwrap();
    }

    #[tokio::test]
    async fn peers_get_distinct_ports() {
        let key = SigningKey::generate(&mut OsRng);
        let router = new_router(key, Config::default());

        let peer_a = Addr(Crypto::new(SigningKey::generate(&mut OsRng)).public_key);
        let peer_b = Addr(Crypto::new(SigningKey::generate(&mut OsRng)).public_key);
        let (port_a, _rx_a) = router.add_peer(peer_a).await.unwrap();
        let (port_b, _rx_b) = router.add_peer(peer_b).await.unwrap();
        assert_ne!(port_a, LOCAL_PORT);
        assert_ne!(port_b, LOCAL_PORT);
        assert_ne!(port_a, port_b);

        router.remove_peer(port_a).await.unwrap();
        router.close().unwrap();
    }
}
