//! Virtual snake maintenance.
//!
//! Keyspace routing over the tree: every node keeps a pointer to the next
//! higher key (ascending) and next lower key (descending), discovered by
//! flooding-free bootstrap walks, and a table of snake paths transiting
//! through it. Frames addressed by key descend the keyspace toward their
//! destination one snake hop at a time.

use std::time::Instant;

use super::{hex_prefix, SnakeEntry, SnakeIndex, State};
use crate::crypto::{dht_ordered, PublicKey};
use crate::peers::LOCAL_PORT;
use crate::types::{Error, Result};
use crate::wire::{
    Frame, FrameType, PathId, Port, SignedTimestamp, SnakeBootstrap, SnakeSetup, SnakeTeardown,
};

/// Replace the running best candidate if `key` is closer to the
/// destination in snake order than what we have.
fn accept_checked(
    best: &mut (PublicKey, Option<Port>),
    dest: &PublicKey,
    bootstrap: bool,
    key: PublicKey,
    port: Option<Port>,
) {
    if !bootstrap && key == *dest && best.0 != *dest {
        *best = (key, port);
    } else if dht_ordered(dest, &key, &best.0) {
        *best = (key, port);
    }
}

impl State {
    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Periodic snake maintenance: expire dead neighbours, re-bootstrap
    /// when the ascending pointer is missing or anchored to a stale root.
    pub fn maintain_snake(&mut self) {
        let root_ann = self.root_announcement();
        let expiry = self.config.neighbour_expiry;
        let can_bootstrap =
            self.parent.is_some() && root_ann.root_key != self.crypto.public_key;
        let mut will_bootstrap = false;

        if let Some(asc) = self.ascending.clone() {
            if asc.expired(expiry) {
                self.send_teardown_for_path(asc.public_key, asc.path_id, None, true);
            } else if asc.root_key != root_ann.root_key
                || asc.root_sequence != root_ann.sequence
            {
                will_bootstrap = can_bootstrap;
            }
        } else {
            will_bootstrap = can_bootstrap;
        }

        if let Some(desc) = self.descending.clone() {
            if desc.expired(expiry) {
                // The descending side re-establishes itself: whoever we were
                // descending for will bootstrap toward us again.
                self.send_teardown_for_path(desc.public_key, desc.path_id, None, false);
            }
        }

        // Transit paths nobody tore down properly still age out.
        self.paths.retain(|_, entry| !entry.expired(expiry));

        if will_bootstrap {
            self.bootstrap_now();
        }
    }

    /// Send a bootstrap into the network to find our ascending neighbour.
    pub(crate) fn bootstrap_now(&mut self) {
        let ann = self.root_announcement();
        let bootstrap = SnakeBootstrap {
            root_key: ann.root_key,
            root_sequence: ann.sequence,
            path_id: rand::random::<PathId>(),
        };
        let mut frame = Frame::new(FrameType::SnakeBootstrap);
        frame.destination_key = self.crypto.public_key;
        frame.source_coords = self.coords();
        frame.payload = Vec::with_capacity(bootstrap.size());
        bootstrap.encode(&mut frame.payload);

        for port in self.next_hops_snek(LOCAL_PORT, &frame, true) {
            if port != LOCAL_PORT && self.peers.push_to(port, frame.clone()) {
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Next-hop by key
    // -----------------------------------------------------------------------

    /// Choose the next hop for a key-addressed frame: the neighbour, peer
    /// ancestor, or transiting path whose key is closest to the destination
    /// from above. Bootstrap frames climb toward the root instead of
    /// stopping at the local key.
    pub(crate) fn next_hops_snek(&self, _from: Port, frame: &Frame, bootstrap: bool) -> Vec<Port> {
        let dest_key = frame.destination_key;
        let local_key = self.crypto.public_key;
        if !bootstrap && dest_key == local_key {
            return vec![LOCAL_PORT];
        }

        let mut root_key = self.root_announcement().root_key;
        let (mut ancestors, parent_port) = self.ancestors();
        if !ancestors.is_empty() {
            root_key = ancestors.remove(0);
        }

        let mut best = (local_key, Some(LOCAL_PORT));

        // The path toward the root is the starting point whenever the
        // destination lies above us in keyspace (or is the root itself).
        if (bootstrap && best.0 == dest_key)
            || dest_key == root_key
            || dht_ordered(&best.0, &dest_key, &root_key)
        {
            best = (root_key, parent_port);
        }

        // Our remaining ancestors, all reached through the parent.
        for ancestor in ancestors {
            accept_checked(&mut best, &dest_key, bootstrap, ancestor, parent_port);
        }

        // Every key our peers' announcements vouch for.
        for peer in self.peers.started() {
            if let Some(rec) = self.announcements.get(&peer.port) {
                for sig in &rec.announcement.signatures {
                    accept_checked(&mut best, &dest_key, bootstrap, sig.public_key, Some(peer.port));
                }
            }
        }

        // If the best key so far is a node we peer with directly, take the
        // direct edge rather than the path we learned it from.
        for peer in self.peers.started() {
            if best.0 == peer.public_key {
                best = (peer.public_key, Some(peer.port));
            }
        }

        // Snake paths transiting through us.
        for entry in self.paths.values() {
            if entry.expired(self.config.neighbour_expiry) {
                continue;
            }
            accept_checked(&mut best, &dest_key, bootstrap, entry.public_key, Some(entry.source));
        }

        best.1.into_iter().collect()
    }

    // -----------------------------------------------------------------------
    // Bootstrap handling
    // -----------------------------------------------------------------------

    /// Decide whether the bootstrapping node should become our descending
    /// neighbour, and acknowledge if so. Runs on the node where the
    /// bootstrap walk stopped.
    pub(crate) fn handle_bootstrap(&mut self, _from: Port, frame: &Frame) -> Result<()> {
        let local_key = self.crypto.public_key;
        if frame.destination_key == local_key {
            // Our own bootstrap came back around.
            return Ok(());
        }
        let bootstrap = SnakeBootstrap::decode(&frame.payload)?;
        let root = self.root_announcement();
        let dst = frame.destination_key;

        let acknowledge = if frame.source_key == local_key {
            false
        } else if bootstrap.root_key != root.root_key || bootstrap.root_sequence != root.sequence {
            // Not converged onto the same root yet.
            false
        } else if let Some(desc) = &self.descending {
            desc.public_key == dst
                || desc.expired(self.config.neighbour_expiry)
                || dht_ordered(&desc.public_key, &dst, &local_key)
        } else {
            dst < local_key
        };
        if !acknowledge {
            return Ok(());
        }

        let ack = SnakeBootstrap {
            root_key: root.root_key,
            root_sequence: root.sequence,
            path_id: bootstrap.path_id,
        };
        let mut out = Frame::new(FrameType::SnakeBootstrapAck);
        out.destination_coords = frame.source_coords.clone();
        out.destination_key = dst;
        out.source_coords = self.coords();
        out.source_key = local_key;
        out.payload = Vec::with_capacity(ack.size());
        ack.encode(&mut out.payload);

        for port in self.next_hops_tree(LOCAL_PORT, &out) {
            if port != LOCAL_PORT && self.peers.push_to(port, out.clone()) {
                break;
            }
        }
        Ok(())
    }

    /// An acknowledgement for our bootstrap: adopt the sender as ascending
    /// neighbour if it is closer than what we have, then set the path up.
    pub(crate) fn handle_bootstrap_ack(&mut self, from: Port, frame: &Frame) -> Result<()> {
        let ack = SnakeBootstrap::decode(&frame.payload)?;
        let root = self.root_announcement();
        let local_key = self.crypto.public_key;
        let src = frame.source_key;

        let update = if src == local_key {
            false
        } else if ack.root_key != root.root_key || ack.root_sequence != root.sequence {
            false
        } else if let Some(asc) = &self.ascending {
            (asc.public_key == src && asc.path_id != ack.path_id)
                || asc.expired(self.config.neighbour_expiry)
                || dht_ordered(&local_key, &src, &asc.public_key)
        } else {
            local_key < src
        };
        if !update {
            return Ok(());
        }

        if let Some(old) = self.ascending.clone() {
            // The remote side cleans up the replaced path; we make sure no
            // stale path to a node that isn't the new ascending lingers.
            self.send_teardown_for_path(old.public_key, old.path_id, None, true);
        }
        self.ascending = Some(SnakeEntry {
            public_key: src,
            path_id: ack.path_id,
            source: from,
            destination: LOCAL_PORT,
            last_seen: Instant::now(),
            root_key: ack.root_key,
            root_sequence: ack.root_sequence,
        });
        tracing::debug!(ascending = %hex_prefix(&src), "ascending neighbour updated");

        let setup = SnakeSetup {
            root_key: root.root_key,
            root_sequence: root.sequence,
            path_id: ack.path_id,
            timestamp: SignedTimestamp::now(&self.crypto),
        };
        let mut out = Frame::new(FrameType::SnakeSetup);
        out.destination_coords = frame.source_coords.clone();
        out.destination_key = src;
        out.source_key = local_key;
        out.payload = Vec::with_capacity(setup.size());
        setup.encode(&mut out.payload);

        for port in self.next_hops_tree(LOCAL_PORT, &out) {
            if port != LOCAL_PORT && self.peers.push_to(port, out.clone()) {
                break;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Setup handling
    // -----------------------------------------------------------------------

    /// Record a snake path. Returns true if we installed a transit entry
    /// and the dispatcher should forward the frame along `next_hops`.
    pub(crate) fn handle_setup(
        &mut self,
        from: Port,
        frame: &Frame,
        next_hops: &[Port],
    ) -> Result<bool> {
        let setup = SnakeSetup::decode(&frame.payload)?;
        if !setup.timestamp.verify(&frame.source_key) {
            return Err(Error::BadSignature);
        }
        let root = self.root_announcement();
        let local_key = self.crypto.public_key;
        let src = frame.source_key;

        // Did the setup hit a dead end on the way to the ascending node?
        let next = next_hops.first().copied();
        if (next.is_none() || next == Some(LOCAL_PORT)) && frame.destination_key != local_key {
            self.send_teardown_for_path(src, setup.path_id, Some(from), false);
            return Ok(false);
        }

        let index = SnakeIndex {
            public_key: src,
            path_id: setup.path_id,
        };
        if self.paths.contains_key(&index) {
            // First teardown cleans our own table, the second tells the
            // sender the path is no good.
            self.send_teardown_for_path(src, setup.path_id, None, false);
            self.send_teardown_for_path(src, setup.path_id, Some(from), false);
            return Err(Error::DuplicateSetup);
        }

        if frame.destination_key == local_key {
            // We are the ascending end: the same decision table as for
            // bootstraps determines whether the origin becomes descending.
            let update = if src == local_key {
                false
            } else if setup.root_key != root.root_key || setup.root_sequence != root.sequence {
                false
            } else if let Some(desc) = &self.descending {
                desc.public_key == src
                    || desc.expired(self.config.neighbour_expiry)
                    || dht_ordered(&desc.public_key, &src, &local_key)
            } else {
                src < local_key
            };
            if update {
                if let Some(old) = self.descending.clone() {
                    self.send_teardown_for_path(old.public_key, old.path_id, None, false);
                }
                let entry = SnakeEntry {
                    public_key: src,
                    path_id: setup.path_id,
                    source: from,
                    destination: LOCAL_PORT,
                    last_seen: Instant::now(),
                    root_key: setup.root_key,
                    root_sequence: setup.root_sequence,
                };
                self.paths.insert(index, entry.clone());
                self.descending = Some(entry);
                tracing::debug!(descending = %hex_prefix(&src), "descending neighbour updated");
                return Ok(false);
            }
            self.send_teardown_for_path(src, setup.path_id, Some(from), false);
            return Ok(false);
        }

        // Transit node: file the path so traffic and teardowns can follow
        // it in either direction.
        self.paths.insert(
            index,
            SnakeEntry {
                public_key: src,
                path_id: setup.path_id,
                source: from,
                destination: next_hops[0],
                last_seen: Instant::now(),
                root_key: setup.root_key,
                root_sequence: setup.root_sequence,
            },
        );
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Teardown handling
    // -----------------------------------------------------------------------

    /// Evict the named path. Returns the peer the teardown should continue
    /// along, if any.
    pub(crate) fn handle_teardown(&mut self, from: Port, frame: &Frame) -> Result<Option<Port>> {
        let teardown = SnakeTeardown::decode(&frame.payload)?;
        Ok(self.teardown_path(Some(from), frame.destination_key, teardown.path_id))
    }

    /// Tear down a path we know about, locally (`via` = None, propagate to
    /// whatever the table says) or as a bounce-back for a path we refused
    /// (`via` = the peer to send it to).
    pub(crate) fn send_teardown_for_path(
        &mut self,
        path_key: PublicKey,
        path_id: PathId,
        via: Option<Port>,
        ascending: bool,
    ) {
        let next_hop = self.teardown_path(None, path_key, path_id);
        let frame = self.get_teardown(path_key, path_id, ascending);
        match via {
            Some(port) => {
                self.peers.push_to(port, frame);
            }
            None => {
                if let Some(port) = next_hop {
                    if port != LOCAL_PORT {
                        self.peers.push_to(port, frame);
                    }
                }
            }
        }
    }

    fn get_teardown(&self, path_key: PublicKey, path_id: PathId, ascending: bool) -> Frame {
        let mut frame = Frame::new(FrameType::SnakeTeardown);
        // A teardown toward our ascending node names *our* key: transit
        // nodes filed the path under the lower of the two endpoint keys.
        frame.destination_key = if ascending {
            self.crypto.public_key
        } else {
            path_key
        };
        let teardown = SnakeTeardown { path_id };
        teardown.encode(&mut frame.payload);
        frame
    }

    /// Remove the path from our state and work out which peer, if any,
    /// the teardown continues toward.
    pub(crate) fn teardown_path(
        &mut self,
        from: Option<Port>,
        path_key: PublicKey,
        path_id: PathId,
    ) -> Option<Port> {
        if let Some(asc) = self.ascending.clone() {
            if asc.path_id == path_id {
                let matches = match from {
                    // From the network the path is named by our key, the
                    // lower end; locally we name it by the remote key.
                    Some(_) => path_key == self.crypto.public_key,
                    None => path_key == asc.public_key,
                };
                if matches {
                    self.ascending = None;
                    self.paths.remove(&SnakeIndex {
                        public_key: asc.public_key,
                        path_id: asc.path_id,
                    });
                    self.reschedule_snake();
                    return Some(asc.source);
                }
            }
        }

        if let Some(desc) = self.descending.clone() {
            if desc.public_key == path_key && desc.path_id == path_id {
                self.descending = None;
                self.paths.remove(&SnakeIndex {
                    public_key: desc.public_key,
                    path_id: desc.path_id,
                });
                return Some(desc.source);
            }
        }

        let index = SnakeIndex {
            public_key: path_key,
            path_id,
        };
        if let Some(entry) = self.paths.remove(&index) {
            match from {
                Some(from) => {
                    if from == entry.source && entry.destination != LOCAL_PORT {
                        return Some(entry.destination);
                    }
                    if from == entry.destination && entry.source != LOCAL_PORT {
                        return Some(entry.source);
                    }
                }
                None => {
                    if entry.source != LOCAL_PORT {
                        return Some(entry.source);
                    }
                    if entry.destination != LOCAL_PORT {
                        return Some(entry.destination);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::Crypto;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tokio::sync::mpsc;

    fn make_state() -> State {
        let crypto = Crypto::new(SigningKey::generate(&mut OsRng));
        let (tx, _rx) = mpsc::channel(16);
        State::new(crypto, Config::default(), tx)
    }

    fn entry(key: [u8; 32], path_id: PathId, source: Port, destination: Port) -> SnakeEntry {
        SnakeEntry {
            public_key: key,
            path_id,
            source,
            destination,
            last_seen: Instant::now(),
            root_key: [0; 32],
            root_sequence: 0,
        }
    }

    #[test]
    fn transit_teardown_exits_via_other_endpoint() {
        let mut state = make_state();
        let key = [7; 32];
        let id = [1; 8];
        state.paths.insert(
            SnakeIndex { public_key: key, path_id: id },
            entry(key, id, 3, 5),
        );

        // Arrived from the lower side: continue toward the higher side.
        assert_eq!(state.teardown_path(Some(3), key, id), Some(5));
        assert!(state.paths.is_empty());

        state.paths.insert(
            SnakeIndex { public_key: key, path_id: id },
            entry(key, id, 3, 5),
        );
        assert_eq!(state.teardown_path(Some(5), key, id), Some(3));
    }

    #[test]
    fn local_teardown_prefers_source_side() {
        let mut state = make_state();
        let key = [7; 32];
        let id = [2; 8];
        state.paths.insert(
            SnakeIndex { public_key: key, path_id: id },
            entry(key, id, 3, 5),
        );
        assert_eq!(state.teardown_path(None, key, id), Some(3));

        // A path terminating here exits via whichever side isn't local.
        state.paths.insert(
            SnakeIndex { public_key: key, path_id: id },
            entry(key, id, LOCAL_PORT, 5),
        );
        assert_eq!(state.teardown_path(None, key, id), Some(5));
    }

    #[test]
    fn ascending_teardown_key_is_asymmetric() {
        let mut state = make_state();
        let remote = [0xAB; 32];
        let id = [3; 8];
        state.ascending = Some(entry(remote, id, 4, LOCAL_PORT));

        // From the network the path is addressed by our (lower) key.
        assert_eq!(
            state.teardown_path(Some(9), state.crypto.public_key, id),
            Some(4)
        );
        assert!(state.ascending.is_none());

        // A local teardown names the remote key instead.
        state.ascending = Some(entry(remote, id, 4, LOCAL_PORT));
        assert_eq!(state.teardown_path(None, remote, id), Some(4));
        assert!(state.ascending.is_none());

        // A mismatched key clears nothing.
        state.ascending = Some(entry(remote, id, 4, LOCAL_PORT));
        assert_eq!(state.teardown_path(Some(9), remote, id), None);
        assert!(state.ascending.is_some());
    }

    #[test]
    fn descending_teardown_matches_key_and_id() {
        let mut state = make_state();
        let remote = [0x01; 32];
        let id = [4; 8];
        state.descending = Some(entry(remote, id, 6, LOCAL_PORT));

        assert_eq!(state.teardown_path(Some(2), remote, [9; 8]), None);
        assert!(state.descending.is_some());
        assert_eq!(state.teardown_path(Some(2), remote, id), Some(6));
        assert!(state.descending.is_none());
    }

    #[test]
    fn expired_paths_are_swept_on_maintenance() {
        let mut state = make_state();
        state.config = Config::default()
            .with_neighbour_expiry(std::time::Duration::from_millis(10));
        let key = [7; 32];
        let id = [5; 8];
        state.paths.insert(
            SnakeIndex { public_key: key, path_id: id },
            entry(key, id, 3, 5),
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
        state.maintain_snake();
        assert!(state.paths.is_empty());
    }
}
