//! Peer table: port-indexed records with bounded outbound channels.
//!
//! Port 0 is the local router sink — frames pushed there are delivered to
//! the application instead of a link. Pushes never block: a full or closed
//! channel drops the frame and the caller moves on to its next candidate.

use tokio::sync::mpsc;

use crate::crypto::PublicKey;
use crate::wire::{Frame, Port};

/// The port index reserved for the local router.
pub(crate) const LOCAL_PORT: Port = 0;

/// A single peer link as the router sees it.
pub(crate) struct Peer {
    pub public_key: PublicKey,
    pub port: Port,
    pub started: bool,
    pub local: bool,
    tx: mpsc::Sender<Frame>,
}

impl Peer {
    /// Non-blocking push of an outbound frame. Returns false if the
    /// channel is full or the far side is gone; the frame is dropped.
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(port = self.port, "peer channel full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// All peer links, indexed by port. The router stores only ports in its
/// tree and snake state; this table owns the records.
pub(crate) struct PeerTable {
    slots: Vec<Option<Peer>>,
}

impl PeerTable {
    /// Create a table whose port 0 is the local delivery sink.
    pub fn new(local_key: PublicKey, local_tx: mpsc::Sender<Frame>) -> Self {
        let local = Peer {
            public_key: local_key,
            port: LOCAL_PORT,
            started: true,
            local: true,
            tx: local_tx,
        };
        Self {
            slots: vec![Some(local)],
        }
    }

    /// Register a started peer on the lowest free port.
    pub fn add(&mut self, public_key: PublicKey, tx: mpsc::Sender<Frame>) -> Port {
        let free = self
            .slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| slot.is_none())
            .map(|(idx, _)| idx);
        let port = match free {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        } as Port;
        self.slots[port as usize] = Some(Peer {
            public_key,
            port,
            started: true,
            local: false,
            tx,
        });
        port
    }

    /// Drop the peer on `port`. Port 0 cannot be removed.
    pub fn remove(&mut self, port: Port) -> Option<Peer> {
        if port == LOCAL_PORT {
            return None;
        }
        self.slots.get_mut(port as usize).and_then(Option::take)
    }

    pub fn get(&self, port: Port) -> Option<&Peer> {
        self.slots.get(port as usize).and_then(Option::as_ref)
    }

    pub fn local(&self) -> &Peer {
        self.slots[LOCAL_PORT as usize]
            .as_ref()
            .expect("local sink is never removed")
    }

    /// Iterate over started non-local peers, in port order.
    pub fn started(&self) -> impl Iterator<Item = &Peer> {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.started && !p.local)
    }

    /// Push a frame to the given port. Unknown ports drop the frame.
    pub fn push_to(&self, port: Port, frame: Frame) -> bool {
        match self.get(port) {
            Some(peer) => peer.push(frame),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameType;

    fn table() -> (PeerTable, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(4);
        (PeerTable::new([0xFF; 32], tx), rx)
    }

    #[test]
    fn ports_allocate_from_one_and_reuse_gaps() {
        let (mut peers, _rx) = table();
        let (tx, _rx1) = mpsc::channel(1);
        let a = peers.add([1; 32], tx.clone());
        let b = peers.add([2; 32], tx.clone());
        let c = peers.add([3; 32], tx.clone());
        assert_eq!((a, b, c), (1, 2, 3));

        peers.remove(b);
        assert!(peers.get(b).is_none());
        let d = peers.add([4; 32], tx);
        assert_eq!(d, b); // freed port reused
    }

    #[test]
    fn local_sink_is_permanent() {
        let (mut peers, _rx) = table();
        assert!(peers.remove(LOCAL_PORT).is_none());
        assert!(peers.local().local);
        assert_eq!(peers.local().port, LOCAL_PORT);
    }

    #[test]
    fn push_is_lossy_when_full() {
        let (mut peers, _local_rx) = table();
        let (tx, rx) = mpsc::channel(1);
        let port = peers.add([1; 32], tx);

        assert!(peers.push_to(port, Frame::new(FrameType::TreeRouted)));
        // Channel capacity is 1: the second push is dropped, not blocked.
        assert!(!peers.push_to(port, Frame::new(FrameType::TreeRouted)));
        drop(rx);
        assert!(!peers.push_to(port, Frame::new(FrameType::TreeRouted)));
    }

    #[test]
    fn started_skips_local() {
        let (mut peers, _rx) = table();
        let (tx, _rx1) = mpsc::channel(1);
        peers.add([1; 32], tx);
        let ports: Vec<Port> = peers.started().map(|p| p.port).collect();
        assert_eq!(ports, vec![1]);
    }
}
