use std::fmt;

/// Ed25519 public key used as a network address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub [u8; 32]);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", self)
    }
}

impl From<[u8; 32]> for Addr {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Addr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Errors returned by snakewood operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("decode error")]
    Decode,
    #[error("router closed")]
    Closed,
    #[error("unrecognized frame type")]
    UnrecognizedFrame,
    #[error("announcement has no signatures")]
    MissingSignatures,
    #[error("announcement first signature doesn't match root key")]
    RootMismatch,
    #[error("announcement last signature is not from the direct peer")]
    SenderMismatch,
    #[error("announcement contains an invalid zero hop")]
    ZeroHop,
    #[error("announcement contains a routing loop")]
    LoopDetected,
    #[error("announcement signature verification failed")]
    BadSignature,
    #[error("setup is a duplicate")]
    DuplicateSetup,
    #[error("peer not found")]
    PeerNotFound,
    #[error("bad key")]
    BadKey,
}

pub type Result<T> = std::result::Result<T, Error>;
