//! Router state: the spanning tree and virtual snake protocol machines.
//!
//! All state lives in a single [`State`] that is only ever touched from
//! the router actor task, so the handlers here are plain synchronous
//! mutations. Frames arrive through [`State::handle_frame`], which
//! classifies them and routes any output to peer push channels. Tree
//! logic lives in `tree.rs`, snake logic in `snake.rs`.

mod snake;
mod tree;

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::crypto::{Crypto, PublicKey};
use crate::peers::{PeerTable, LOCAL_PORT};
use crate::types::Addr;
use crate::wire::{Frame, FrameType, PathId, Port, TreeAnnouncement};

/// A tree announcement stored against the peer it arrived from.
#[derive(Clone)]
pub(crate) struct AnnouncementRecord {
    pub announcement: TreeAnnouncement,
    pub receive_time: Instant,
    pub receive_order: u64,
}

/// Key of the snake path table: the path's origin and its random id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SnakeIndex {
    pub public_key: PublicKey,
    pub path_id: PathId,
}

/// A snake path through (or terminating at) this node. `source` is the
/// peer toward the lower-keyed end, `destination` toward the higher; for
/// the ascending and descending neighbour records, `source` is the peer
/// the path arrived over and `destination` is the local router.
#[derive(Clone)]
pub(crate) struct SnakeEntry {
    pub public_key: PublicKey,
    pub path_id: PathId,
    pub source: Port,
    pub destination: Port,
    pub last_seen: Instant,
    pub root_key: PublicKey,
    pub root_sequence: u64,
}

impl SnakeEntry {
    pub fn expired(&self, expiry: std::time::Duration) -> bool {
        self.last_seen.elapsed() >= expiry
    }
}

/// Point-in-time view of the routing state, for diagnostics and tests.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    /// Our coordinates: the signed hop vector from the root.
    pub coords: Vec<Port>,
    /// The root key we currently believe in.
    pub root: Addr,
    /// Port of the chosen parent, or None if we are root.
    pub parent: Option<Port>,
    /// Key of the ascending (next higher) snake neighbour.
    pub ascending: Option<Addr>,
    /// Key of the descending (next lower) snake neighbour.
    pub descending: Option<Addr>,
    /// Number of snake paths in the table, transit included.
    pub snake_paths: usize,
}

pub(crate) struct State {
    pub crypto: Crypto,
    pub config: Config,
    pub peers: PeerTable,

    // Tree state
    pub announcements: HashMap<Port, AnnouncementRecord>,
    pub parent: Option<Port>,
    pub sequence: u64,
    pub ordering: u64,

    // Snake state
    pub ascending: Option<SnakeEntry>,
    pub descending: Option<SnakeEntry>,
    pub paths: HashMap<SnakeIndex, SnakeEntry>,

    // Set when a handler wants snake maintenance to run before the next
    // tick, e.g. after an ascending path teardown.
    snake_reschedule: bool,
}

impl State {
    pub fn new(crypto: Crypto, config: Config, local_tx: mpsc::Sender<Frame>) -> Self {
        let peers = PeerTable::new(crypto.public_key, local_tx);
        Self {
            crypto,
            config,
            peers,
            announcements: HashMap::new(),
            parent: None,
            sequence: 0,
            ordering: 0,
            ascending: None,
            descending: None,
            paths: HashMap::new(),
            snake_reschedule: false,
        }
    }

    // -----------------------------------------------------------------------
    // Peer lifecycle
    // -----------------------------------------------------------------------

    pub fn handle_peer_up(&mut self, key: PublicKey, tx: mpsc::Sender<Frame>) -> Port {
        let port = self.peers.add(key, tx);
        tracing::debug!(port, key = %hex_prefix(&key), "peer up");
        port
    }

    pub fn handle_peer_down(&mut self, port: Port) {
        tracing::debug!(port, "peer down");

        // Tear down every snake path that ran over the vanished link. The
        // push toward the dead port fails harmlessly; the surviving side
        // still gets notified.
        if let Some(asc) = self.ascending.clone() {
            if asc.source == port {
                self.send_teardown_for_path(asc.public_key, asc.path_id, None, true);
            }
        }
        if let Some(desc) = self.descending.clone() {
            if desc.source == port {
                self.send_teardown_for_path(desc.public_key, desc.path_id, None, false);
            }
        }
        let affected: Vec<SnakeIndex> = self
            .paths
            .iter()
            .filter(|(_, v)| v.source == port || v.destination == port)
            .map(|(k, _)| *k)
            .collect();
        for index in affected {
            self.send_teardown_for_path(index.public_key, index.path_id, None, false);
        }

        self.announcements.remove(&port);
        self.peers.remove(port);

        if self.parent == Some(port) {
            self.select_new_parent();
        }
    }

    // -----------------------------------------------------------------------
    // Frame dispatcher
    // -----------------------------------------------------------------------

    /// Classify an inbound frame and run the matching handler. Errors are
    /// the caller's to log; the state is left consistent either way.
    pub fn handle_frame(&mut self, from: Port, frame: Frame) -> crate::types::Result<()> {
        match frame.frame_type {
            FrameType::TreeAnnouncement => self.handle_tree_announcement(from, &frame),

            FrameType::SnakeBootstrap => {
                // Bootstraps ride the snake until no node is closer to the
                // slot below the origin key; that node handles them.
                let hops = self.next_hops_snek(from, &frame, true);
                match hops.first() {
                    Some(&next) if next != LOCAL_PORT => {
                        self.peers.push_to(next, frame);
                        Ok(())
                    }
                    _ => self.handle_bootstrap(from, &frame),
                }
            }

            FrameType::SnakeBootstrapAck => {
                let hops = self.next_hops_tree(from, &frame);
                match hops.first() {
                    Some(&next) if next != LOCAL_PORT => {
                        self.peers.push_to(next, frame);
                        Ok(())
                    }
                    Some(_) => self.handle_bootstrap_ack(from, &frame),
                    None => Ok(()), // nowhere closer and not for us
                }
            }

            FrameType::SnakeSetup => {
                let hops = self.next_hops_tree(from, &frame);
                let forward = self.handle_setup(from, &frame, &hops)?;
                if forward {
                    self.peers.push_to(hops[0], frame);
                }
                Ok(())
            }

            FrameType::SnakeTeardown => {
                if let Some(next) = self.handle_teardown(from, &frame)? {
                    self.peers.push_to(next, frame);
                }
                Ok(())
            }

            FrameType::TreeRouted | FrameType::SnakeRouted => {
                let hops = if frame.destination_coords.is_empty()
                    && frame.destination_key != [0u8; 32]
                {
                    self.next_hops_snek(from, &frame, false)
                } else {
                    self.next_hops_tree(from, &frame)
                };
                if let Some(&next) = hops.first() {
                    self.peers.push_to(next, frame);
                }
                Ok(())
            }
        }
    }

    /// Run snake maintenance now if a handler asked for it.
    pub fn run_pending_maintenance(&mut self) {
        if self.snake_reschedule {
            self.snake_reschedule = false;
            self.maintain_snake();
        }
    }

    pub(crate) fn reschedule_snake(&mut self) {
        self.snake_reschedule = true;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            coords: self.coords(),
            root: Addr(self.root_announcement().root_key),
            parent: self.parent,
            ascending: self.ascending.as_ref().map(|a| Addr(a.public_key)),
            descending: self.descending.as_ref().map(|d| Addr(d.public_key)),
            snake_paths: self.paths.len(),
        }
    }
}

pub(crate) fn hex_prefix(key: &PublicKey) -> String {
    hex::encode(&key[..4])
}
