//! Crypto capability: hashing for ACK tokens and channel hashes, X25519
//! shared-secret derivation, and keypair generation.
//!
//! The server core never touches primitive APIs directly; everything goes
//! through [`CryptoProvider`] so tests can substitute a deterministic
//! implementation if needed.

use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use super::{Identity, LocalIdentity, PUB_KEY_SIZE};

/// Cryptographic primitives the server core depends on.
pub trait CryptoProvider {
    /// SHA-256 over the concatenation of `parts`.
    fn sha256(&self, parts: &[&[u8]]) -> [u8; 32];

    /// Derive the symmetric shared secret between our secret key and a
    /// peer's public key.
    fn shared_secret(&self, local: &LocalIdentity, peer: &Identity) -> [u8; PUB_KEY_SIZE];

    /// Generate a fresh keypair: `(public, secret)`.
    fn generate_keypair(&self) -> ([u8; PUB_KEY_SIZE], [u8; PUB_KEY_SIZE]);

    /// Fill `dest` with random bytes.
    fn random_bytes(&self, dest: &mut [u8]);

    /// The 32-bit ACK token a peer will produce after receiving `payload`:
    /// the first four bytes (little-endian) of `SHA256(payload || peer_pub)`.
    fn ack_token(&self, payload: &[u8], peer: &Identity) -> u32 {
        let digest = self.sha256(&[payload, &peer.pub_key]);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// One-byte channel hash: first byte of `SHA256(secret)`.
    fn channel_hash(&self, secret: &[u8]) -> u8 {
        self.sha256(&[secret])[0]
    }
}

/// Default provider backed by `sha2`, `x25519-dalek` and the OS RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdCrypto;

impl CryptoProvider for StdCrypto {
    fn sha256(&self, parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    fn shared_secret(&self, local: &LocalIdentity, peer: &Identity) -> [u8; PUB_KEY_SIZE] {
        let secret = StaticSecret::from(local.secret);
        let peer_pub = PublicKey::from(peer.pub_key);
        *secret.diffie_hellman(&peer_pub).as_bytes()
    }

    fn generate_keypair(&self) -> ([u8; PUB_KEY_SIZE], [u8; PUB_KEY_SIZE]) {
        let mut seed = [0u8; PUB_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        (*public.as_bytes(), secret.to_bytes())
    }

    fn random_bytes(&self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}
