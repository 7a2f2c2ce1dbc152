//! Node identity persistence: load the long-term keypair, or generate a
//! fresh one on first boot.

use anyhow::{bail, Result};
use log::info;

use super::BlobStore;
use crate::mesh::crypto::CryptoProvider;
use crate::mesh::{Identity, LocalIdentity, PUB_KEY_SIZE};

/// Logical blob name of the stored identity.
pub const IDENTITY_FILE: &str = "/identity";

const IDENTITY_LEN: usize = PUB_KEY_SIZE * 2;

/// How many times to retry generation before giving up on avoiding a
/// reserved hash slot.
const MAX_GEN_ATTEMPTS: usize = 10;

/// Load this node's identity from the store, generating and persisting a
/// fresh one when absent or unreadable.
///
/// Public keys whose first byte is `0x00` or `0xFF` land in reserved hash
/// slots and are rejected during generation (up to [`MAX_GEN_ATTEMPTS`]
/// tries before accepting whatever came last).
pub fn load_or_create<C: CryptoProvider>(store: &BlobStore, crypto: &C) -> Result<LocalIdentity> {
    if store.exists(IDENTITY_FILE) {
        match load(store) {
            Ok(id) => return Ok(id),
            Err(e) => {
                log::warn!("stored identity unreadable ({e}), generating a new one");
            }
        }
    }

    let mut pair = crypto.generate_keypair();
    for _ in 1..MAX_GEN_ATTEMPTS {
        if pair.0[0] != 0x00 && pair.0[0] != 0xFF {
            break;
        }
        pair = crypto.generate_keypair();
    }
    let identity = LocalIdentity {
        id: Identity::new(pair.0),
        secret: pair.1,
    };

    save(store, &identity)?;
    info!(
        "generated new node identity [{}]",
        crate::logutil::hex_prefix(&identity.id.pub_key)
    );
    Ok(identity)
}

fn load(store: &BlobStore) -> Result<LocalIdentity> {
    let bytes = store.read_all(IDENTITY_FILE)?;
    if bytes.len() != IDENTITY_LEN {
        bail!("identity blob has wrong length {}", bytes.len());
    }
    let mut pub_key = [0u8; PUB_KEY_SIZE];
    let mut secret = [0u8; PUB_KEY_SIZE];
    pub_key.copy_from_slice(&bytes[..PUB_KEY_SIZE]);
    secret.copy_from_slice(&bytes[PUB_KEY_SIZE..]);
    Ok(LocalIdentity {
        id: Identity::new(pub_key),
        secret,
    })
}

fn save(store: &BlobStore, identity: &LocalIdentity) -> Result<()> {
    let mut bytes = Vec::with_capacity(IDENTITY_LEN);
    bytes.extend_from_slice(&identity.id.pub_key);
    bytes.extend_from_slice(&identity.secret);
    store.write_all(IDENTITY_FILE, &bytes)
}
