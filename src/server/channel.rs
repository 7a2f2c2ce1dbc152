//! Broadcast channel configuration.
//!
//! Public mode derives the channel secret from the first bytes of the
//! node's own public key, so anyone who knows the node can listen. Private
//! mode uses a randomly generated secret persisted to storage; the operator
//! reads it back with `get channel.key` and shares it out of band.

use anyhow::Result;
use log::debug;

use super::CONFIG_GUARD;
use crate::mesh::crypto::CryptoProvider;
use crate::mesh::{GroupChannel, Identity, CHANNEL_KEY_LEN};
use crate::storage::{BlobRule, BlobStore};

/// Logical blob name of the persisted config.
pub const CHANNEL_CONFIG_FILE: &str = "/channel_cfg";

/// Persisted blob length: mode u8 + secret + guard u32.
pub const CHANNEL_CONFIG_LEN: usize = 1 + CHANNEL_KEY_LEN + 4;

/// Broadcast channel state: persistent mode/secret plus the derived
/// runtime channel.
pub struct ChannelState {
    mode_private: bool,
    secret: [u8; CHANNEL_KEY_LEN],
    runtime: GroupChannel,
    initialised: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelState {
    pub fn new() -> Self {
        Self {
            mode_private: false,
            secret: [0u8; CHANNEL_KEY_LEN],
            runtime: GroupChannel::default(),
            initialised: false,
        }
    }

    pub fn is_private(&self) -> bool {
        self.mode_private
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn runtime(&self) -> &GroupChannel {
        &self.runtime
    }

    /// Hex of the key a subscriber needs: the stored secret in private
    /// mode, the node public key prefix in public mode.
    pub fn key_hex(&self, self_id: &Identity) -> String {
        if self.mode_private {
            hex::encode_upper(self.secret)
        } else {
            hex::encode_upper(&self_id.pub_key[..CHANNEL_KEY_LEN])
        }
    }

    /// Derive the runtime channel from the current mode.
    pub fn initialise<C: CryptoProvider>(&mut self, self_id: &Identity, crypto: &C) {
        let mut secret = [0u8; CHANNEL_KEY_LEN];
        if self.mode_private {
            secret.copy_from_slice(&self.secret);
        } else {
            secret.copy_from_slice(&self_id.pub_key[..CHANNEL_KEY_LEN]);
        }
        self.runtime = GroupChannel {
            hash: crypto.channel_hash(&secret),
            secret,
        };
        self.initialised = true;
        debug!(
            "channel initialised: mode={}, hash={:#04x}",
            if self.mode_private { "private" } else { "public" },
            self.runtime.hash
        );
    }

    /// Switch to public mode. Returns false when already public.
    pub fn set_public<C: CryptoProvider>(&mut self, self_id: &Identity, crypto: &C) -> bool {
        if !self.mode_private {
            return false;
        }
        self.mode_private = false;
        self.secret = [0u8; CHANNEL_KEY_LEN];
        self.initialise(self_id, crypto);
        true
    }

    /// Switch to private mode with a fresh random secret. Returns false
    /// when already private.
    pub fn set_private<C: CryptoProvider>(&mut self, self_id: &Identity, crypto: &C) -> bool {
        if self.mode_private {
            return false;
        }
        crypto.random_bytes(&mut self.secret);
        self.mode_private = true;
        self.initialise(self_id, crypto);
        true
    }

    pub fn save(&self, store: &BlobStore) -> Result<()> {
        let mut out = Vec::with_capacity(CHANNEL_CONFIG_LEN);
        out.push(self.mode_private as u8);
        out.extend_from_slice(&self.secret);
        out.extend_from_slice(&CONFIG_GUARD.to_le_bytes());
        store.write_all(CHANNEL_CONFIG_FILE, &out)
    }

    /// Load the persisted mode/secret; a missing or guard-failing blob
    /// leaves public-mode defaults (and the caller should persist them).
    /// Returns true when a stored config was accepted.
    pub fn load(&mut self, store: &BlobStore) -> Result<bool> {
        if !store.exists(CHANNEL_CONFIG_FILE) {
            return Ok(false);
        }
        let bytes = store.read_all(CHANNEL_CONFIG_FILE)?;
        if bytes.len() != CHANNEL_CONFIG_LEN {
            return Ok(false);
        }
        let guard_start = 1 + CHANNEL_KEY_LEN;
        let guard = u32::from_le_bytes([
            bytes[guard_start],
            bytes[guard_start + 1],
            bytes[guard_start + 2],
            bytes[guard_start + 3],
        ]);
        if guard != CONFIG_GUARD {
            return Ok(false);
        }
        self.mode_private = bytes[0] != 0;
        self.secret.copy_from_slice(&bytes[1..1 + CHANNEL_KEY_LEN]);
        Ok(true)
    }

    /// Validation rule for mirror restore.
    pub fn blob_rule() -> BlobRule {
        BlobRule::guarded(CHANNEL_CONFIG_LEN, CONFIG_GUARD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::crypto::StdCrypto;
    use crate::mesh::PUB_KEY_SIZE;
    use tempfile::tempdir;

    fn self_id() -> Identity {
        Identity::new([0x42; PUB_KEY_SIZE])
    }

    #[test]
    fn public_mode_derives_secret_from_own_key() {
        let mut chan = ChannelState::new();
        chan.initialise(&self_id(), &StdCrypto);
        assert_eq!(&chan.runtime().secret[..], &[0x42; CHANNEL_KEY_LEN][..]);
        assert_eq!(chan.key_hex(&self_id()), "42".repeat(CHANNEL_KEY_LEN));
    }

    #[test]
    fn private_mode_generates_and_persists_secret() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();

        let mut chan = ChannelState::new();
        chan.initialise(&self_id(), &StdCrypto);
        assert!(chan.set_private(&self_id(), &StdCrypto));
        assert!(!chan.set_private(&self_id(), &StdCrypto));
        let secret = chan.runtime().secret;
        assert_ne!(&secret[..], &[0x42; CHANNEL_KEY_LEN][..]);
        chan.save(&store).unwrap();

        let mut restored = ChannelState::new();
        assert!(restored.load(&store).unwrap());
        restored.initialise(&self_id(), &StdCrypto);
        assert!(restored.is_private());
        assert_eq!(restored.runtime().secret, secret);
    }

    #[test]
    fn bad_guard_is_ignored() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        store
            .write_all(CHANNEL_CONFIG_FILE, &[0u8; CHANNEL_CONFIG_LEN])
            .unwrap();
        let mut chan = ChannelState::new();
        assert!(!chan.load(&store).unwrap());
        assert!(!chan.is_private());
    }

    #[test]
    fn switching_back_to_public_clears_secret() {
        let mut chan = ChannelState::new();
        chan.initialise(&self_id(), &StdCrypto);
        chan.set_private(&self_id(), &StdCrypto);
        assert!(chan.set_public(&self_id(), &StdCrypto));
        assert!(!chan.is_private());
        assert_eq!(&chan.runtime().secret[..], &[0x42; CHANNEL_KEY_LEN][..]);
    }
}
