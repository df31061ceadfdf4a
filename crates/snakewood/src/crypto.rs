use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::types::Addr;

pub(crate) const PUBLIC_KEY_SIZE: usize = 32;
pub(crate) const SIGNATURE_SIZE: usize = 64;

/// Fixed-size public key for internal use.
pub(crate) type PublicKey = [u8; PUBLIC_KEY_SIZE];

/// Fixed-size signature for internal use.
pub(crate) type Sig = [u8; SIGNATURE_SIZE];

/// Cryptographic identity: holds signing key and derived public key.
pub(crate) struct Crypto {
    pub signing_key: SigningKey,
    pub public_key: PublicKey,
}

impl Crypto {
    pub fn new(signing_key: SigningKey) -> Self {
        let public_key: PublicKey = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            public_key,
        }
    }

    /// Sign a message with our private key.
    pub fn sign(&self, message: &[u8]) -> Sig {
        let sig = self.signing_key.sign(message);
        sig.to_bytes()
    }

    /// Verify a signature from the given public key.
    pub fn verify(key: &PublicKey, message: &[u8], sig: &Sig) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };
        verifying_key.verify(message, &signature).is_ok()
    }

    /// Get our public key as an Addr.
    pub fn addr(&self) -> Addr {
        Addr(self.public_key)
    }
}

/// Strict keyspace ordering `a < b < c`, no wraparound.
pub(crate) fn dht_ordered(a: &PublicKey, b: &PublicKey, c: &PublicKey) -> bool {
    a < b && b < c
}
