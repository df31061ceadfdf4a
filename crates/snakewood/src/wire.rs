//! Wire protocol: frame envelope, protocol payloads, encoding and decoding.
//!
//! All variable-length integers use unsigned LEB128 (uvarint) encoding.
//! Coordinates are sequences of non-zero uvarint port numbers terminated
//! by 0 — port 0 is reserved for the local router, so the terminator is
//! unambiguous.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{Crypto, PublicKey, Sig, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::types::{Error, Result};

/// Port identifier for a peer link. Port 0 is the local router.
pub type Port = u64;

/// Random 8-byte identifier naming a snake path at its origin.
pub type PathId = [u8; 8];

pub(crate) const PATH_ID_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    TreeAnnouncement = 1,
    SnakeBootstrap = 2,
    SnakeBootstrapAck = 3,
    SnakeSetup = 4,
    SnakeTeardown = 5,
    /// Application payload routed greedily by tree coordinates.
    TreeRouted = 6,
    /// Application payload routed by destination key along the snake.
    SnakeRouted = 7,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::TreeAnnouncement),
            2 => Ok(Self::SnakeBootstrap),
            3 => Ok(Self::SnakeBootstrapAck),
            4 => Ok(Self::SnakeSetup),
            5 => Ok(Self::SnakeTeardown),
            6 => Ok(Self::TreeRouted),
            7 => Ok(Self::SnakeRouted),
            _ => Err(Error::UnrecognizedFrame),
        }
    }
}

// ---------------------------------------------------------------------------
// Uvarint helpers (unsigned LEB128)
// ---------------------------------------------------------------------------

/// Encode a u64 as uvarint, appending to `out`.
pub(crate) fn encode_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a uvarint from the front of `data`. Returns (value, bytes_consumed).
pub(crate) fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 63 && byte > 1 {
            return None; // overflow
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if i >= 9 {
            return None; // too many bytes
        }
    }
    None // incomplete
}

/// Compute the encoded size of a uvarint.
pub(crate) fn uvarint_size(mut value: u64) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

// ---------------------------------------------------------------------------
// Coordinate helpers (zero-terminated uvarint sequences)
// ---------------------------------------------------------------------------

/// Encode coordinates as zero-terminated uvarints.
pub(crate) fn encode_coords(out: &mut Vec<u8>, coords: &[Port]) {
    for &port in coords {
        encode_uvarint(out, port);
    }
    encode_uvarint(out, 0); // terminator
}

/// Compute the wire size of a coordinate sequence.
pub(crate) fn coords_size(coords: &[Port]) -> usize {
    let mut size = 0;
    for &port in coords {
        size += uvarint_size(port);
    }
    size + uvarint_size(0)
}

/// Decode zero-terminated coordinates. Returns (coords, bytes_consumed).
pub(crate) fn decode_coords(data: &[u8]) -> Result<(Vec<Port>, usize)> {
    let mut coords = Vec::new();
    let mut offset = 0;
    loop {
        let (value, len) = decode_uvarint(&data[offset..]).ok_or(Error::Decode)?;
        offset += len;
        if value == 0 {
            break;
        }
        coords.push(value);
    }
    Ok((coords, offset))
}

// ---------------------------------------------------------------------------
// Decoder helper: reads from a &[u8] cursor
// ---------------------------------------------------------------------------

/// A cursor for decoding wire messages.
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read the remaining bytes.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    pub fn read_uvarint(&mut self) -> Result<u64> {
        let (value, len) = decode_uvarint(self.data).ok_or(Error::Decode)?;
        self.data = &self.data[len..];
        Ok(value)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.data.len() < N {
            return Err(Error::Decode);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[..N]);
        self.data = &self.data[N..];
        Ok(out)
    }

    pub fn read_public_key(&mut self) -> Result<PublicKey> {
        self.read_fixed::<PUBLIC_KEY_SIZE>()
    }

    pub fn read_signature(&mut self) -> Result<Sig> {
        self.read_fixed::<SIGNATURE_SIZE>()
    }

    pub fn read_coords(&mut self) -> Result<Vec<Port>> {
        let (coords, consumed) = decode_coords(self.data)?;
        self.data = &self.data[consumed..];
        Ok(coords)
    }
}

// ---------------------------------------------------------------------------
// Frame envelope
// ---------------------------------------------------------------------------

/// Transport envelope wrapping every protocol payload.
///
/// Unset keys are all-zero; unset coordinates are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub destination_coords: Vec<Port>,
    pub source_coords: Vec<Port>,
    pub destination_key: [u8; 32],
    pub source_key: [u8; 32],
    pub payload: Vec<u8>,
}

impl Frame {
    pub(crate) fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            destination_coords: Vec::new(),
            source_coords: Vec::new(),
            destination_key: [0u8; 32],
            source_key: [0u8; 32],
            payload: Vec::new(),
        }
    }

    /// An application payload addressed by tree coordinates.
    pub fn tree_routed(destination_coords: Vec<Port>, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(FrameType::TreeRouted);
        frame.destination_coords = destination_coords;
        frame.payload = payload;
        frame
    }

    /// An application payload addressed by public key, routed along the
    /// snake when no coordinates are known.
    pub fn snake_routed(destination_key: [u8; 32], source_key: [u8; 32], payload: Vec<u8>) -> Self {
        let mut frame = Self::new(FrameType::SnakeRouted);
        frame.destination_key = destination_key;
        frame.source_key = source_key;
        frame.payload = payload;
        frame
    }

    pub fn size(&self) -> usize {
        1 + coords_size(&self.destination_coords)
            + coords_size(&self.source_coords)
            + PUBLIC_KEY_SIZE
            + PUBLIC_KEY_SIZE
            + self.payload.len()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.frame_type as u8);
        encode_coords(out, &self.destination_coords);
        encode_coords(out, &self.source_coords);
        out.extend_from_slice(&self.destination_key);
        out.extend_from_slice(&self.source_key);
        out.extend_from_slice(&self.payload);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        let type_byte: [u8; 1] = r.read_fixed()?;
        let frame_type = FrameType::try_from(type_byte[0])?;
        let destination_coords = r.read_coords()?;
        let source_coords = r.read_coords()?;
        let destination_key = r.read_public_key()?;
        let source_key = r.read_public_key()?;
        let payload = r.rest().to_vec();
        Ok(Self {
            frame_type,
            destination_coords,
            source_coords,
            destination_key,
            source_key,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Tree announcement
// ---------------------------------------------------------------------------

/// One link of the announcement signature chain.
///
/// `hop` is the signer's port number toward the node the announcement was
/// sent to; it is never zero in a valid chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignatureWithHop {
    pub hop: Port,
    pub public_key: PublicKey,
    pub signature: Sig,
}

/// A spanning tree announcement: the root's key and sequence plus the
/// signature chain accumulated on the way here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct TreeAnnouncement {
    pub root_key: PublicKey,
    pub sequence: u64,
    pub signatures: Vec<SignatureWithHop>,
}

impl TreeAnnouncement {
    /// The coordinates this announcement assigns to the node it was sent
    /// to: every signed hop in order, root first.
    pub fn coords(&self) -> Vec<Port> {
        self.signatures.iter().map(|s| s.hop).collect()
    }

    /// The position of the peer that sent this announcement: every signed
    /// hop except the final one toward us.
    pub fn peer_coords(&self) -> Vec<Port> {
        let mut coords = self.coords();
        coords.pop();
        coords
    }

    /// True if `key` already appears anywhere in the signature chain.
    pub fn is_loop_or_child_of(&self, key: &PublicKey) -> bool {
        self.signatures.iter().any(|s| s.public_key == *key)
    }

    /// The bytes covered by the signature at `index`: everything encoded
    /// before it, plus the signer's own key and hop.
    fn signing_prefix(&self, index: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.root_key);
        encode_uvarint(&mut out, self.sequence);
        for sig in &self.signatures[..index] {
            encode_uvarint(&mut out, sig.hop);
            out.extend_from_slice(&sig.public_key);
            out.extend_from_slice(&sig.signature);
        }
        let sig = &self.signatures[index];
        encode_uvarint(&mut out, sig.hop);
        out.extend_from_slice(&sig.public_key);
        out
    }

    /// Extend the chain with our signature for the given outbound port.
    /// Returns `None` if our key is already in the chain — sending such an
    /// announcement would create a routing loop.
    pub fn for_peer(&self, crypto: &Crypto, port: Port) -> Option<TreeAnnouncement> {
        if self.is_loop_or_child_of(&crypto.public_key) {
            return None;
        }
        let mut signed = self.clone();
        signed.signatures.push(SignatureWithHop {
            hop: port,
            public_key: crypto.public_key,
            signature: [0u8; SIGNATURE_SIZE],
        });
        let index = signed.signatures.len() - 1;
        let prefix = signed.signing_prefix(index);
        signed.signatures[index].signature = crypto.sign(&prefix);
        Some(signed)
    }

    /// Structurally and cryptographically validate the chain as received
    /// from the direct peer `sender`.
    pub fn validate(&self, sender: &PublicKey) -> Result<()> {
        if self.signatures.is_empty() {
            return Err(Error::MissingSignatures);
        }
        let last = self.signatures.len() - 1;
        for (index, sig) in self.signatures.iter().enumerate() {
            if index == 0 && sig.public_key != self.root_key {
                return Err(Error::RootMismatch);
            }
            if sig.hop == 0 {
                return Err(Error::ZeroHop);
            }
            if index == last && sig.public_key != *sender {
                return Err(Error::SenderMismatch);
            }
            if self.signatures[..index]
                .iter()
                .any(|prev| prev.public_key == sig.public_key)
            {
                return Err(Error::LoopDetected);
            }
            let prefix = self.signing_prefix(index);
            if !Crypto::verify(&sig.public_key, &prefix, &sig.signature) {
                return Err(Error::BadSignature);
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        let mut size = PUBLIC_KEY_SIZE + uvarint_size(self.sequence);
        for sig in &self.signatures {
            size += uvarint_size(sig.hop) + PUBLIC_KEY_SIZE + SIGNATURE_SIZE;
        }
        size + uvarint_size(0)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.root_key);
        encode_uvarint(out, self.sequence);
        for sig in &self.signatures {
            encode_uvarint(out, sig.hop);
            out.extend_from_slice(&sig.public_key);
            out.extend_from_slice(&sig.signature);
        }
        encode_uvarint(out, 0); // terminator
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        let root_key = r.read_public_key()?;
        let sequence = r.read_uvarint()?;
        let mut signatures = Vec::new();
        loop {
            let hop = r.read_uvarint()?;
            if hop == 0 {
                break;
            }
            let public_key = r.read_public_key()?;
            let signature = r.read_signature()?;
            signatures.push(SignatureWithHop {
                hop,
                public_key,
                signature,
            });
        }
        if !r.is_empty() {
            return Err(Error::Decode);
        }
        Ok(Self {
            root_key,
            sequence,
            signatures,
        })
    }
}

// ---------------------------------------------------------------------------
// Snake payloads
// ---------------------------------------------------------------------------

/// Bootstrap and bootstrap acknowledgement share the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SnakeBootstrap {
    pub root_key: PublicKey,
    pub root_sequence: u64,
    pub path_id: PathId,
}

impl SnakeBootstrap {
    pub fn size(&self) -> usize {
        PUBLIC_KEY_SIZE + uvarint_size(self.root_sequence) + PATH_ID_SIZE
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.root_key);
        encode_uvarint(out, self.root_sequence);
        out.extend_from_slice(&self.path_id);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        let root_key = r.read_public_key()?;
        let root_sequence = r.read_uvarint()?;
        let path_id = r.read_fixed::<PATH_ID_SIZE>()?;
        if !r.is_empty() {
            return Err(Error::Decode);
        }
        Ok(Self {
            root_key,
            root_sequence,
            path_id,
        })
    }
}

/// A timestamp signed by the sender, proving the setup is freshly minted.
/// The signature is verified for authenticity; enforcing a freshness
/// window is left to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignedTimestamp {
    pub seconds: u64,
    pub signature: Sig,
}

impl SignedTimestamp {
    pub fn now(crypto: &Crypto) -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut bytes = Vec::with_capacity(uvarint_size(seconds));
        encode_uvarint(&mut bytes, seconds);
        Self {
            seconds,
            signature: crypto.sign(&bytes),
        }
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        let mut bytes = Vec::with_capacity(uvarint_size(self.seconds));
        encode_uvarint(&mut bytes, self.seconds);
        Crypto::verify(key, &bytes, &self.signature)
    }
}

/// Path setup, sent along the tree from the bootstrapping node to its new
/// ascending neighbour once the acknowledgement arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SnakeSetup {
    pub root_key: PublicKey,
    pub root_sequence: u64,
    pub path_id: PathId,
    pub timestamp: SignedTimestamp,
}

impl SnakeSetup {
    pub fn size(&self) -> usize {
        PUBLIC_KEY_SIZE
            + uvarint_size(self.root_sequence)
            + PATH_ID_SIZE
            + uvarint_size(self.timestamp.seconds)
            + SIGNATURE_SIZE
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.root_key);
        encode_uvarint(out, self.root_sequence);
        out.extend_from_slice(&self.path_id);
        encode_uvarint(out, self.timestamp.seconds);
        out.extend_from_slice(&self.timestamp.signature);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        let root_key = r.read_public_key()?;
        let root_sequence = r.read_uvarint()?;
        let path_id = r.read_fixed::<PATH_ID_SIZE>()?;
        let seconds = r.read_uvarint()?;
        let signature = r.read_signature()?;
        if !r.is_empty() {
            return Err(Error::Decode);
        }
        Ok(Self {
            root_key,
            root_sequence,
            path_id,
            timestamp: SignedTimestamp { seconds, signature },
        })
    }
}

/// Teardown: evicts the named path from every node along it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SnakeTeardown {
    pub path_id: PathId,
}

impl SnakeTeardown {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.path_id);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        let path_id = r.read_fixed::<PATH_ID_SIZE>()?;
        if !r.is_empty() {
            return Err(Error::Decode);
        }
        Ok(Self { path_id })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn make_crypto() -> Crypto {
        Crypto::new(SigningKey::generate(&mut OsRng))
    }

    #[test]
    fn uvarint_roundtrip() {
        for &val in &[0u64, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX >> 1] {
            let mut buf = Vec::new();
            encode_uvarint(&mut buf, val);
            let (decoded, len) = decode_uvarint(&buf).unwrap();
            assert_eq!(decoded, val);
            assert_eq!(len, buf.len());
            assert_eq!(len, uvarint_size(val));
        }
    }

    #[test]
    fn coords_roundtrip() {
        let coords = vec![1, 2, 300, 65535];
        let mut buf = Vec::new();
        encode_coords(&mut buf, &coords);
        assert_eq!(buf.len(), coords_size(&coords));
        let (decoded, consumed) = decode_coords(&buf).unwrap();
        assert_eq!(decoded, coords);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = Frame {
            frame_type: FrameType::SnakeRouted,
            destination_coords: vec![1, 2],
            source_coords: vec![3],
            destination_key: [0x11; 32],
            source_key: [0x22; 32],
            payload: b"hello".to_vec(),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), frame.size());
        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn announcement_roundtrip_is_byte_stable() {
        let root = make_crypto();
        let ann = TreeAnnouncement {
            root_key: root.public_key,
            sequence: 7,
            signatures: Vec::new(),
        };
        let signed = ann.for_peer(&root, 3).unwrap();

        let mut first = Vec::new();
        signed.encode(&mut first);
        assert_eq!(first.len(), signed.size());
        let decoded = TreeAnnouncement::decode(&first).unwrap();
        let mut second = Vec::new();
        decoded.encode(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn for_peer_extends_chain_and_verifies() {
        let root = make_crypto();
        let mid = make_crypto();

        // Root signs toward mid on port 1; mid re-signs toward a peer on port 2.
        let ann = TreeAnnouncement {
            root_key: root.public_key,
            sequence: 1,
            signatures: Vec::new(),
        };
        let at_mid = ann.for_peer(&root, 1).unwrap();
        at_mid.validate(&root.public_key).unwrap();

        let at_leaf = at_mid.for_peer(&mid, 2).unwrap();
        assert_eq!(at_leaf.signatures.len(), 2);
        assert_eq!(at_leaf.signatures[0], at_mid.signatures[0]);
        assert_eq!(at_leaf.signatures[1].public_key, mid.public_key);
        assert_eq!(at_leaf.signatures[1].hop, 2);
        at_leaf.validate(&mid.public_key).unwrap();

        assert_eq!(at_leaf.coords(), vec![1, 2]);
        assert_eq!(at_leaf.peer_coords(), vec![1]);
    }

    #[test]
    fn for_peer_refuses_to_loop() {
        let root = make_crypto();
        let ann = TreeAnnouncement {
            root_key: root.public_key,
            sequence: 1,
            signatures: Vec::new(),
        };
        let signed = ann.for_peer(&root, 1).unwrap();
        // Root's key is already in the chain now.
        assert!(signed.for_peer(&root, 2).is_none());
    }

    #[test]
    fn validate_rejects_tampered_chain() {
        let root = make_crypto();
        let ann = TreeAnnouncement {
            root_key: root.public_key,
            sequence: 1,
            signatures: Vec::new(),
        };
        let mut signed = ann.for_peer(&root, 1).unwrap();
        signed.sequence += 1;
        assert!(matches!(
            signed.validate(&root.public_key),
            Err(Error::BadSignature)
        ));
    }

    #[test]
    fn validate_rejects_wrong_sender() {
        let root = make_crypto();
        let other = make_crypto();
        let ann = TreeAnnouncement {
            root_key: root.public_key,
            sequence: 1,
            signatures: Vec::new(),
        };
        let signed = ann.for_peer(&root, 1).unwrap();
        assert!(matches!(
            signed.validate(&other.public_key),
            Err(Error::SenderMismatch)
        ));
    }

    #[test]
    fn bootstrap_roundtrip() {
        let b = SnakeBootstrap {
            root_key: [0xAA; 32],
            root_sequence: 300,
            path_id: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let mut buf = Vec::new();
        b.encode(&mut buf);
        assert_eq!(buf.len(), b.size());
        assert_eq!(SnakeBootstrap::decode(&buf).unwrap(), b);
    }

    #[test]
    fn setup_roundtrip_and_timestamp_verifies() {
        let crypto = make_crypto();
        let setup = SnakeSetup {
            root_key: [0xBB; 32],
            root_sequence: 9,
            path_id: [8; 8],
            timestamp: SignedTimestamp::now(&crypto),
        };
        let mut buf = Vec::new();
        setup.encode(&mut buf);
        assert_eq!(buf.len(), setup.size());
        let decoded = SnakeSetup::decode(&buf).unwrap();
        assert_eq!(decoded, setup);
        assert!(decoded.timestamp.verify(&crypto.public_key));
        assert!(!decoded.timestamp.verify(&make_crypto().public_key));
    }

    #[test]
    fn teardown_roundtrip() {
        let t = SnakeTeardown { path_id: [9; 8] };
        let mut buf = Vec::new();
        t.encode(&mut buf);
        assert_eq!(SnakeTeardown::decode(&buf).unwrap(), t);
    }
}
