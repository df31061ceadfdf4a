//! Spanning tree maintenance.
//!
//! The node with the greatest public key in the connected component wins
//! the root election. Everyone else picks a parent from the announcements
//! they hold and takes the signed hop vector in the parent's announcement
//! as their coordinates. Greedy forwarding moves frames to whichever peer
//! is closest to the destination in tree distance.

use std::time::Instant;

use super::{hex_prefix, AnnouncementRecord, State};
use crate::peers::LOCAL_PORT;
use crate::types::Result;
use crate::wire::{Frame, FrameType, Port, TreeAnnouncement};

/// Number of edits to transform one coordinate vector into the other:
/// `len(a) + len(b) - 2 * |common prefix|`.
pub(crate) fn tree_distance(a: &[Port], b: &[Port]) -> u64 {
    let lcp = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    (a.len() + b.len() - 2 * lcp) as u64
}

impl State {
    /// The announcement our coordinates derive from: the parent's record,
    /// or a synthetic self-rooted one when we believe we are root.
    pub(crate) fn root_announcement(&self) -> TreeAnnouncement {
        self.parent_record()
            .map(|rec| rec.announcement.clone())
            .unwrap_or_else(|| TreeAnnouncement {
                root_key: self.crypto.public_key,
                sequence: self.sequence,
                signatures: Vec::new(),
            })
    }

    fn parent_record(&self) -> Option<&AnnouncementRecord> {
        self.parent.and_then(|p| self.announcements.get(&p))
    }

    pub(crate) fn coords(&self) -> Vec<Port> {
        self.root_announcement().coords()
    }

    /// The public keys on our path from the root (root first, us excluded),
    /// plus the parent port they are all reached through.
    pub(crate) fn ancestors(&self) -> (Vec<crate::crypto::PublicKey>, Option<Port>) {
        match self.parent_record() {
            Some(rec) => {
                let keys = rec
                    .announcement
                    .signatures
                    .iter()
                    .map(|s| s.public_key)
                    .collect();
                (keys, self.parent)
            }
            None => (Vec::new(), None),
        }
    }

    // -----------------------------------------------------------------------
    // Announcement emission
    // -----------------------------------------------------------------------

    /// Periodic tree maintenance: roots push a fresh announcement to every
    /// started peer; everyone else checks that the parent is still heard
    /// from. Non-roots only re-broadcast from the reception rules.
    pub fn maintain_tree(&mut self) {
        match self.parent_record() {
            None => {
                self.sequence += 1;
                self.send_tree_announcements();
            }
            Some(rec) if rec.receive_time.elapsed() >= self.config.announce_timeout => {
                // The parent has gone quiet past the announcement timeout.
                self.select_new_parent();
            }
            Some(_) => {}
        }
    }

    pub(crate) fn send_tree_announcements(&self) {
        let ann = self.root_announcement();
        for peer in self.peers.started() {
            self.send_tree_announcement_to_peer(&ann, peer.port);
        }
    }

    fn send_tree_announcement_to_peer(&self, ann: &TreeAnnouncement, port: Port) {
        // Signing appends our hop toward this peer; a chain already
        // containing our key is suppressed rather than sent as a loop.
        let Some(signed) = ann.for_peer(&self.crypto, port) else {
            return;
        };
        let mut frame = Frame::new(FrameType::TreeAnnouncement);
        frame.payload = Vec::with_capacity(signed.size());
        signed.encode(&mut frame.payload);
        self.peers.push_to(port, frame);
    }

    // -----------------------------------------------------------------------
    // Announcement reception
    // -----------------------------------------------------------------------

    pub(crate) fn handle_tree_announcement(&mut self, from: Port, frame: &Frame) -> Result<()> {
        let sender = self
            .peers
            .get(from)
            .map(|p| p.public_key)
            .ok_or(crate::types::Error::PeerNotFound)?;

        let new_update = TreeAnnouncement::decode(&frame.payload)?;
        new_update.validate(&sender)?;

        // Snapshot what the current parent last told us before the store
        // below can overwrite it.
        let last = self.parent_record();
        let last_root_key = last
            .map(|rec| rec.announcement.root_key)
            .unwrap_or(self.crypto.public_key);
        let last_sequence = last.map(|rec| rec.announcement.sequence).unwrap_or(0);
        let last_receive_time = last.map(|rec| rec.receive_time);
        let last_coords = last
            .map(|rec| rec.announcement.coords())
            .unwrap_or_default();

        self.ordering += 1;
        self.announcements.insert(
            from,
            AnnouncementRecord {
                announcement: new_update.clone(),
                receive_time: Instant::now(),
                receive_order: self.ordering,
            },
        );

        let key_delta = new_update.root_key.cmp(&last_root_key);
        let from_parent = self.parent == Some(from);
        let is_loop = new_update.is_loop_or_child_of(&self.crypto.public_key);
        let last_stale = match last_receive_time {
            Some(t) => t.elapsed() >= self.config.announce_timeout,
            // No parent record means we are root; any announcement is a
            // reason to look for a better one.
            None => true,
        };

        use std::cmp::Ordering::*;
        match () {
            _ if last_stale => self.select_new_parent(),
            _ if key_delta == Greater && !is_loop => {
                // A stronger root. This peer is a better parent.
                self.parent = Some(from);
                self.send_tree_announcements();
            }
            _ if from_parent && key_delta == Equal && new_update.sequence > last_sequence => {
                // Same root, fresher sequence: repeat it to our peers.
                self.send_tree_announcements();
            }
            _ if from_parent
                && (is_loop || key_delta == Less || new_update.sequence <= last_sequence) =>
            {
                // Our parent looped through us, got weaker, or started
                // repeating itself. Time to look elsewhere.
                self.select_new_parent();
            }
            _ => {}
        }

        let latest = self.root_announcement();
        let latest_coords = latest.coords();
        if latest_coords != last_coords {
            tracing::debug!(coords = ?latest_coords, "new coords");
        }
        if latest.root_key != last_root_key {
            tracing::debug!(root = %hex_prefix(&latest.root_key), "root changed");
            self.reschedule_snake();
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Parent selection
    // -----------------------------------------------------------------------

    pub(crate) fn select_new_parent(&mut self) {
        let mut best_key = self.crypto.public_key;
        let mut best_seq = 0u64;
        let mut best_order = u64::MAX;
        let mut best_port: Option<Port> = None;

        for (&port, rec) in &self.announcements {
            if rec.receive_time.elapsed() >= self.config.announce_timeout {
                continue;
            }
            let ann = &rec.announcement;
            if ann.is_loop_or_child_of(&self.crypto.public_key) {
                continue;
            }
            let accepted = match ann.root_key.cmp(&best_key) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => {
                    ann.sequence > best_seq
                        || (ann.sequence == best_seq && rec.receive_order < best_order)
                }
            };
            if accepted {
                best_key = ann.root_key;
                best_seq = ann.sequence;
                best_order = rec.receive_order;
                best_port = Some(port);
            }
        }

        match best_port {
            Some(port) => {
                // Only re-announce if the parent actually changed.
                if self.parent != Some(port) {
                    self.parent = Some(port);
                    self.send_tree_announcements();
                }
            }
            None => self.become_root(),
        }
    }

    fn become_root(&mut self) {
        if self.parent.is_none() {
            return;
        }
        self.parent = None;
        tracing::debug!("became root");
        self.maintain_tree();
    }

    // -----------------------------------------------------------------------
    // Greedy next-hop
    // -----------------------------------------------------------------------

    /// Pick the peer that takes the frame closest to its destination
    /// coordinates, or the local router if nobody is closer than us.
    pub(crate) fn next_hops_tree(&self, from: Port, frame: &Frame) -> Vec<Port> {
        let dest = &frame.destination_coords;
        let our_coords = self.coords();
        if *dest == our_coords {
            return vec![LOCAL_PORT];
        }
        let our_dist = tree_distance(&our_coords, dest);
        if our_dist == 0 {
            return vec![LOCAL_PORT];
        }

        let root_key = self.root_announcement().root_key;
        let mut best: Option<Port> = None;
        let mut best_dist = our_dist;
        for peer in self.peers.started() {
            if peer.port == from {
                continue;
            }
            let Some(rec) = self.announcements.get(&peer.port) else {
                continue;
            };
            // A peer under a different root has incomparable coordinates;
            // forwarding there would only create loops.
            if rec.announcement.root_key != root_key {
                continue;
            }
            let peer_coords = rec.announcement.peer_coords();
            let peer_dist = tree_distance(&peer_coords, dest);
            if peer_dist == 0 || peer_coords == *dest {
                // The peer is the destination itself.
                return vec![peer.port];
            }
            if peer_dist < best_dist {
                best_dist = peer_dist;
                best = Some(peer.port);
            }
        }
        best.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::Crypto;
    use crate::wire::SignatureWithHop;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A state whose key is guaranteed to sort below the 0xE0.. fake root
    /// keys the tests hand out, so candidates are actually accepted.
    fn make_state(config: Config) -> State {
        let crypto = loop {
            let c = Crypto::new(SigningKey::generate(&mut OsRng));
            if c.public_key[0] < 0xE0 {
                break c;
            }
        };
        let (tx, _rx) = mpsc::channel(16);
        State::new(crypto, config, tx)
    }

    fn fake_announcement(root_key: [u8; 32], sequence: u64, chain: &[([u8; 32], Port)]) -> TreeAnnouncement {
        TreeAnnouncement {
            root_key,
            sequence,
            signatures: chain
                .iter()
                .map(|&(public_key, hop)| SignatureWithHop {
                    hop,
                    public_key,
                    signature: [0u8; 64],
                })
                .collect(),
        }
    }

    fn record(state: &mut State, port: Port, ann: TreeAnnouncement) {
        state.ordering += 1;
        let order = state.ordering;
        state.announcements.insert(
            port,
            AnnouncementRecord {
                announcement: ann,
                receive_time: Instant::now(),
                receive_order: order,
            },
        );
    }

    #[test]
    fn distance_counts_edits_past_common_prefix() {
        assert_eq!(tree_distance(&[], &[]), 0);
        assert_eq!(tree_distance(&[1, 2], &[1, 2]), 0);
        assert_eq!(tree_distance(&[1, 2, 3], &[1, 2]), 1);
        assert_eq!(tree_distance(&[1, 2], &[1, 3]), 2);
        assert_eq!(tree_distance(&[5], &[1, 2, 3]), 4);
    }

    #[test]
    fn selection_prefers_stronger_root() {
        let mut state = make_state(Config::default());
        record(&mut state, 1, fake_announcement([0xE1; 32], 5, &[([0xE1; 32], 1)]));
        record(&mut state, 2, fake_announcement([0xE2; 32], 1, &[([0xE2; 32], 1)]));
        state.select_new_parent();
        assert_eq!(state.parent, Some(2));
    }

    #[test]
    fn selection_breaks_key_ties_by_sequence_then_order() {
        let mut state = make_state(Config::default());
        record(&mut state, 1, fake_announcement([0xE1; 32], 3, &[([0xE1; 32], 1)]));
        record(&mut state, 2, fake_announcement([0xE1; 32], 5, &[([0xE1; 32], 2)]));
        state.select_new_parent();
        assert_eq!(state.parent, Some(2));

        // Same key and sequence everywhere: earliest received wins.
        let mut state = make_state(Config::default());
        record(&mut state, 7, fake_announcement([0xE1; 32], 5, &[([0xE1; 32], 1)]));
        record(&mut state, 8, fake_announcement([0xE1; 32], 5, &[([0xE1; 32], 2)]));
        state.select_new_parent();
        assert_eq!(state.parent, Some(7));
    }

    #[test]
    fn selection_ignores_loops_and_expired_records() {
        let timeout = Duration::from_millis(30);
        let mut state = make_state(Config::default().with_announce_timeout(timeout));
        let local = state.crypto.public_key;

        // An announcement that routes through us is not a parent candidate.
        record(
            &mut state,
            1,
            fake_announcement([0xFF; 32], 1, &[([0xFF; 32], 1), (local, 2)]),
        );
        state.select_new_parent();
        assert_eq!(state.parent, None);

        // A fresh candidate is chosen, but once it goes stale we fall back
        // to being root.
        record(&mut state, 2, fake_announcement([0xEE; 32], 1, &[([0xEE; 32], 1)]));
        state.select_new_parent();
        assert_eq!(state.parent, Some(2));
        std::thread::sleep(timeout + Duration::from_millis(10));
        state.select_new_parent();
        assert_eq!(state.parent, None);
    }

    #[test]
    fn root_announcement_is_self_rooted_without_parent() {
        let mut state = make_state(Config::default());
        state.sequence = 9;
        let ann = state.root_announcement();
        assert_eq!(ann.root_key, state.crypto.public_key);
        assert_eq!(ann.sequence, 9);
        assert!(ann.coords().is_empty());
    }

    #[test]
    fn maintain_tree_bumps_sequence_only_as_root() {
        let mut state = make_state(Config::default());
        state.maintain_tree();
        state.maintain_tree();
        assert_eq!(state.sequence, 2);

        record(&mut state, 1, fake_announcement([0xFF; 32], 1, &[([0xFF; 32], 1)]));
        state.parent = Some(1);
        state.maintain_tree();
        assert_eq!(state.sequence, 2);
    }
}
