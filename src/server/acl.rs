//! Access-control list of known clients.
//!
//! Insertion-ordered; the scheduler's round-robin index and the system
//! message attempt counters are keyed on positions in this list, and
//! entries are never removed at runtime, only re-permissioned.

use anyhow::{bail, Result};
use log::debug;

use super::{PERM_ROLE_ADMIN, PERM_ROLE_GUEST, PERM_ROLE_MASK, PERM_ROLE_READ_WRITE};
use crate::mesh::{Identity, MAX_PATH_LEN, PUB_KEY_SIZE};
use crate::storage::BlobStore;

/// Logical blob name of the persisted ACL.
pub const CONTACTS_FILE: &str = "/s_contacts";

/// Fixed on-disk record length, used as the blob's size-alignment rule.
pub const ACL_RECORD_LEN: usize = PUB_KEY_SIZE + 1 + 4 + 2 + 1 + MAX_PATH_LEN + PUB_KEY_SIZE;

/// Per-client push/sync state ("room" state).
#[derive(Clone, Copy, Debug, Default)]
pub struct RoomState {
    /// Timestamp of the newest post this client has confirmed.
    pub sync_since: u32,
    /// Expected 32-bit ACK token; 0 when no push is in flight.
    pub pending_ack: u32,
    /// Millisecond deadline for the in-flight push.
    pub ack_timeout: u64,
    /// Timestamp of the in-flight post.
    pub push_post_timestamp: u32,
    /// Consecutive unacknowledged pushes.
    pub push_failures: u8,
}

/// Everything the server knows about one client.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub id: Identity,
    pub permissions: u8,
    pub shared_secret: [u8; PUB_KEY_SIZE],
    /// Cached return route; `None` means unknown, use flood.
    pub out_path: Option<Vec<u8>>,
    /// Highest sender-timestamp ever accepted from this client.
    pub last_timestamp: u32,
    /// Server-clock timestamp of last observed liveness; 0 means never.
    pub last_activity: u32,
    pub room: RoomState,
}

impl ClientInfo {
    fn new(id: Identity, permissions: u8) -> Self {
        Self {
            id,
            permissions,
            shared_secret: [0u8; PUB_KEY_SIZE],
            out_path: None,
            last_timestamp: 0,
            last_activity: 0,
            room: RoomState::default(),
        }
    }

    pub fn role(&self) -> u8 {
        self.permissions & PERM_ROLE_MASK
    }

    pub fn is_admin(&self) -> bool {
        self.role() == PERM_ROLE_ADMIN
    }

    pub fn is_guest(&self) -> bool {
        self.role() == PERM_ROLE_GUEST
    }

    pub fn role_name(&self) -> &'static str {
        match self.role() {
            PERM_ROLE_ADMIN => "admin",
            PERM_ROLE_READ_WRITE => "read_write",
            super::PERM_ROLE_READ_ONLY => "read_only",
            _ => "guest",
        }
    }
}

/// Ordered set of known clients keyed by public key.
#[derive(Default)]
pub struct ClientAcl {
    clients: Vec<ClientInfo>,
}

impl ClientAcl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&ClientInfo> {
        self.clients.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ClientInfo> {
        self.clients.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients.iter()
    }

    /// Prefix lookup; returns the first entry whose key starts with
    /// `prefix`, or `None`.
    pub fn get_by_pubkey(&self, prefix: &[u8]) -> Option<&ClientInfo> {
        self.index_by_pubkey(prefix).map(|i| &self.clients[i])
    }

    pub fn index_by_pubkey(&self, prefix: &[u8]) -> Option<usize> {
        if prefix.is_empty() || prefix.len() > PUB_KEY_SIZE {
            return None;
        }
        self.clients
            .iter()
            .position(|c| c.id.pub_key.starts_with(prefix))
    }

    /// Idempotent insert: an existing entry is returned unchanged.
    /// Returns the entry's index.
    pub fn put(&mut self, id: Identity, initial_perm: u8) -> usize {
        if let Some(i) = self.index_by_pubkey(&id.pub_key) {
            return i;
        }
        self.clients.push(ClientInfo::new(id, initial_perm));
        self.clients.len() - 1
    }

    /// Admin permission update. Refuses to modify the node's own identity.
    /// A full 32-byte key creates an entry if one does not exist; a shorter
    /// prefix only updates an existing match.
    pub fn apply_permissions(&mut self, self_id: &Identity, prefix: &[u8], perm: u8) -> bool {
        if prefix.is_empty() || self_id.pub_key.starts_with(prefix) {
            return false;
        }
        if let Some(i) = self.index_by_pubkey(prefix) {
            self.clients[i].permissions = perm;
            debug!(
                "permissions for [{}] set to {:#04x}",
                crate::logutil::hex_prefix(prefix),
                perm
            );
            return true;
        }
        if prefix.len() == PUB_KEY_SIZE {
            let mut key = [0u8; PUB_KEY_SIZE];
            key.copy_from_slice(prefix);
            self.put(Identity::new(key), perm);
            return true;
        }
        false
    }

    /// Persist entries selected by `filter` as fixed-size records.
    pub fn save<F>(&self, store: &BlobStore, filter: F) -> Result<()>
    where
        F: Fn(&ClientInfo) -> bool,
    {
        let mut out = Vec::new();
        for client in self.clients.iter().filter(|c| filter(c)) {
            out.extend_from_slice(&client.id.pub_key);
            out.push(client.permissions);
            out.extend_from_slice(&client.last_timestamp.to_le_bytes());
            out.extend_from_slice(&[0u8; 2]); // reserved
            match &client.out_path {
                Some(path) => {
                    out.push(path.len() as u8);
                    let mut padded = [0u8; MAX_PATH_LEN];
                    padded[..path.len()].copy_from_slice(path);
                    out.extend_from_slice(&padded);
                }
                None => {
                    out.push(0xFF);
                    out.extend_from_slice(&[0u8; MAX_PATH_LEN]);
                }
            }
            out.extend_from_slice(&client.shared_secret);
        }
        store.write_all(CONTACTS_FILE, &out)
    }

    /// Replace the in-memory list from the persisted image. Runtime room
    /// state starts fresh; a reboot forgets in-flight pushes by design.
    pub fn load(&mut self, store: &BlobStore) -> Result<()> {
        self.clients.clear();
        if !store.exists(CONTACTS_FILE) {
            return Ok(());
        }
        let bytes = store.read_all(CONTACTS_FILE)?;
        if bytes.len() % ACL_RECORD_LEN != 0 {
            bail!(
                "contacts blob length {} not a multiple of record size",
                bytes.len()
            );
        }
        for rec in bytes.chunks_exact(ACL_RECORD_LEN) {
            let mut key = [0u8; PUB_KEY_SIZE];
            key.copy_from_slice(&rec[..PUB_KEY_SIZE]);
            let mut client = ClientInfo::new(Identity::new(key), rec[PUB_KEY_SIZE]);
            client.last_timestamp = u32::from_le_bytes([
                rec[PUB_KEY_SIZE + 1],
                rec[PUB_KEY_SIZE + 2],
                rec[PUB_KEY_SIZE + 3],
                rec[PUB_KEY_SIZE + 4],
            ]);
            let path_len = rec[PUB_KEY_SIZE + 7];
            let path_start = PUB_KEY_SIZE + 8;
            if path_len != 0xFF && (path_len as usize) <= MAX_PATH_LEN {
                client.out_path =
                    Some(rec[path_start..path_start + path_len as usize].to_vec());
            }
            let secret_start = path_start + MAX_PATH_LEN;
            client
                .shared_secret
                .copy_from_slice(&rec[secret_start..secret_start + PUB_KEY_SIZE]);
            self.clients.push(client);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ident(first: u8) -> Identity {
        let mut key = [0u8; PUB_KEY_SIZE];
        key[0] = first;
        key[1] = first.wrapping_add(1);
        Identity::new(key)
    }

    #[test]
    fn put_is_idempotent() {
        let mut acl = ClientAcl::new();
        let a = acl.put(ident(1), 0);
        acl.get_mut(a).unwrap().permissions = PERM_ROLE_ADMIN;
        let b = acl.put(ident(1), 0);
        assert_eq!(a, b);
        assert_eq!(acl.len(), 1);
        // existing entry returned unchanged
        assert_eq!(acl.get(b).unwrap().permissions, PERM_ROLE_ADMIN);
    }

    #[test]
    fn prefix_lookup_matches_at_most_one() {
        let mut acl = ClientAcl::new();
        acl.put(ident(0x10), 0);
        acl.put(ident(0x20), 0);
        assert!(acl.get_by_pubkey(&[0x20]).is_some());
        assert!(acl.get_by_pubkey(&[0x30]).is_none());
    }

    #[test]
    fn apply_permissions_refuses_own_identity() {
        let mut acl = ClientAcl::new();
        let me = ident(0xEE);
        assert!(!acl.apply_permissions(&me, &me.pub_key, PERM_ROLE_ADMIN));
        assert!(acl.is_empty());
    }

    #[test]
    fn apply_permissions_full_key_creates_entry() {
        let mut acl = ClientAcl::new();
        let me = ident(0xEE);
        let other = ident(0x31);
        assert!(acl.apply_permissions(&me, &other.pub_key, PERM_ROLE_ADMIN));
        assert!(acl.get_by_pubkey(&[0x31]).unwrap().is_admin());
        // short prefix updates in place
        assert!(acl.apply_permissions(&me, &[0x31], 0));
        assert_eq!(acl.get_by_pubkey(&[0x31]).unwrap().permissions, 0);
    }

    #[test]
    fn save_filter_persists_admins_only() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();

        let mut acl = ClientAcl::new();
        let i = acl.put(ident(1), PERM_ROLE_ADMIN);
        acl.get_mut(i).unwrap().last_timestamp = 123;
        acl.get_mut(i).unwrap().out_path = Some(vec![9, 8, 7]);
        acl.put(ident(2), PERM_ROLE_READ_WRITE);
        acl.save(&store, |c| c.is_admin()).unwrap();

        let mut reloaded = ClientAcl::new();
        reloaded.load(&store).unwrap();
        assert_eq!(reloaded.len(), 1);
        let c = reloaded.get(0).unwrap();
        assert!(c.is_admin());
        assert_eq!(c.last_timestamp, 123);
        assert_eq!(c.out_path.as_deref(), Some(&[9u8, 8, 7][..]));
        // runtime room state does not survive a reboot
        assert_eq!(c.room.pending_ack, 0);
    }

    #[test]
    fn load_rejects_misaligned_blob() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        store.write_all(CONTACTS_FILE, &[0u8; 10]).unwrap();
        let mut acl = ClientAcl::new();
        assert!(acl.load(&store).is_err());
    }
}
