//! Persistent queue of system messages with per-admin delivery tracking.
//!
//! System messages announce operational events (reboots, clock sync,
//! channel mode changes) and are pushed to admins only. Each message keeps
//! a bounded set of 6-byte public-key prefixes of the admins that have
//! ACKed it; fully-delivered messages are reaped by [`SystemMessageQueue::cleanup`].

use anyhow::{bail, Result};

use super::acl::{ClientAcl, ClientInfo};
use super::{MAX_CLIENTS, MAX_POST_TEXT_LEN, MAX_SYSTEM_MESSAGES};
use crate::storage::BlobStore;

/// Logical blob name of the persisted queue.
pub const SYSTEM_MSGS_FILE: &str = "/system_msgs";

const TEXT_FIELD_LEN: usize = MAX_POST_TEXT_LEN + 1;
const DELIVERED_FIELD_LEN: usize = MAX_CLIENTS * 6;
const RECORD_LEN: usize = TEXT_FIELD_LEN + 4 + 4 + DELIVERED_FIELD_LEN;

/// One queued system message.
#[derive(Clone, Debug, Default)]
pub struct SystemMessage {
    pub text: String,
    /// Boot number, for ordering across reboots.
    pub boot_sequence: u32,
    /// Millis since boot, for ordering within one boot.
    pub created_millis: u32,
    /// 6-byte pub-key prefixes of admins that have ACKed this message.
    delivered_to: Vec<[u8; 6]>,
}

impl SystemMessage {
    pub fn delivered_to(&self, admin: &ClientInfo) -> bool {
        let prefix = admin.id.prefix6();
        self.delivered_to.iter().any(|p| *p == prefix)
    }
}

/// Bounded persistent queue with eviction of the oldest entry.
#[derive(Default)]
pub struct SystemMessageQueue {
    messages: Vec<SystemMessage>,
}

impl SystemMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&SystemMessage> {
        self.messages.get(idx)
    }

    /// Queue a message. When full, the oldest by `(boot_sequence,
    /// created_millis)` is evicted first. Callers pre-format `text` as
    /// `"SYSTEM: boot:<n> msg:<text>"` so companion apps can deduplicate
    /// across reboots.
    pub fn add(&mut self, text: &str, boot_sequence: u32, created_millis: u32) {
        if self.messages.len() >= MAX_SYSTEM_MESSAGES {
            if let Some(oldest) = self
                .messages
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| (m.boot_sequence, m.created_millis))
                .map(|(i, _)| i)
            {
                self.messages.remove(oldest);
            }
        }
        let mut text = text.to_string();
        text.truncate(MAX_POST_TEXT_LEN);
        self.messages.push(SystemMessage {
            text,
            boot_sequence,
            created_millis,
            delivered_to: Vec::new(),
        });
    }

    /// True iff `client` is an admin that has not yet ACKed message `idx`.
    pub fn needs_push(&self, idx: usize, client: &ClientInfo) -> bool {
        if !client.is_admin() {
            return false;
        }
        match self.messages.get(idx) {
            Some(msg) => !msg.delivered_to(client),
            None => false,
        }
    }

    /// Record delivery to `admin` (idempotent).
    pub fn mark_pushed(&mut self, idx: usize, admin: &ClientInfo) {
        let Some(msg) = self.messages.get_mut(idx) else {
            return;
        };
        let prefix = admin.id.prefix6();
        if !msg.delivered_to.iter().any(|p| *p == prefix) && msg.delivered_to.len() < MAX_CLIENTS {
            msg.delivered_to.push(prefix);
        }
    }

    /// Remove every message whose delivered set covers all currently-known
    /// admins. With no admins in the ACL nothing is removed - the queue
    /// waits for one to appear. Returns the number of messages removed.
    pub fn cleanup(&mut self, acl: &ClientAcl) -> usize {
        let admins: Vec<&ClientInfo> = acl.iter().filter(|c| c.is_admin()).collect();
        if admins.is_empty() {
            return 0;
        }
        let before = self.messages.len();
        self.messages
            .retain(|msg| !admins.iter().all(|a| msg.delivered_to(a)));
        before - self.messages.len()
    }

    /// Persist as a count prefix followed by fixed-size records.
    pub fn save(&self, store: &BlobStore) -> Result<()> {
        let mut out = Vec::with_capacity(1 + self.messages.len() * RECORD_LEN);
        out.push(self.messages.len() as u8);
        for msg in &self.messages {
            let mut text_field = [0u8; TEXT_FIELD_LEN];
            let text = msg.text.as_bytes();
            let n = text.len().min(MAX_POST_TEXT_LEN);
            text_field[..n].copy_from_slice(&text[..n]);
            out.extend_from_slice(&text_field);
            out.extend_from_slice(&msg.boot_sequence.to_le_bytes());
            out.extend_from_slice(&msg.created_millis.to_le_bytes());
            let mut delivered = [0u8; DELIVERED_FIELD_LEN];
            for (i, prefix) in msg.delivered_to.iter().enumerate() {
                delivered[i * 6..i * 6 + 6].copy_from_slice(prefix);
            }
            out.extend_from_slice(&delivered);
        }
        store.write_all(SYSTEM_MSGS_FILE, &out)
    }

    pub fn load(&mut self, store: &BlobStore) -> Result<()> {
        self.messages.clear();
        if !store.exists(SYSTEM_MSGS_FILE) {
            return Ok(());
        }
        let bytes = store.read_all(SYSTEM_MSGS_FILE)?;
        if bytes.is_empty() {
            return Ok(());
        }
        let count = (bytes[0] as usize).min(MAX_SYSTEM_MESSAGES);
        if bytes.len() < 1 + count * RECORD_LEN {
            bail!("system message blob truncated");
        }
        for i in 0..count {
            let rec = &bytes[1 + i * RECORD_LEN..1 + (i + 1) * RECORD_LEN];
            let text_end = rec[..TEXT_FIELD_LEN]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(TEXT_FIELD_LEN);
            let text = String::from_utf8_lossy(&rec[..text_end]).into_owned();
            let boot_sequence = u32::from_le_bytes([
                rec[TEXT_FIELD_LEN],
                rec[TEXT_FIELD_LEN + 1],
                rec[TEXT_FIELD_LEN + 2],
                rec[TEXT_FIELD_LEN + 3],
            ]);
            let created_millis = u32::from_le_bytes([
                rec[TEXT_FIELD_LEN + 4],
                rec[TEXT_FIELD_LEN + 5],
                rec[TEXT_FIELD_LEN + 6],
                rec[TEXT_FIELD_LEN + 7],
            ]);
            let mut delivered_to = Vec::new();
            let delivered = &rec[TEXT_FIELD_LEN + 8..];
            for slot in delivered.chunks_exact(6) {
                // a slot is occupied when its first two bytes are non-zero
                if slot[0] != 0 || slot[1] != 0 {
                    let mut prefix = [0u8; 6];
                    prefix.copy_from_slice(slot);
                    delivered_to.push(prefix);
                }
            }
            self.messages.push(SystemMessage {
                text,
                boot_sequence,
                created_millis,
                delivered_to,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Identity, PUB_KEY_SIZE};
    use crate::server::{PERM_ROLE_ADMIN, PERM_ROLE_READ_WRITE};
    use tempfile::tempdir;

    fn client(first: u8, perm: u8) -> ClientInfo {
        let mut key = [0u8; PUB_KEY_SIZE];
        key[0] = first;
        key[1] = 0xA0;
        ClientInfo {
            id: Identity::new(key),
            permissions: perm,
            shared_secret: [0; PUB_KEY_SIZE],
            out_path: None,
            last_timestamp: 0,
            last_activity: 0,
            room: Default::default(),
        }
    }

    #[test]
    fn needs_push_is_admin_only() {
        let mut q = SystemMessageQueue::new();
        q.add("SYSTEM: boot:1 msg:hello", 1, 0);
        assert!(q.needs_push(0, &client(1, PERM_ROLE_ADMIN)));
        assert!(!q.needs_push(0, &client(2, PERM_ROLE_READ_WRITE)));
        assert!(!q.needs_push(5, &client(1, PERM_ROLE_ADMIN)));
    }

    #[test]
    fn mark_pushed_is_idempotent() {
        let mut q = SystemMessageQueue::new();
        q.add("msg", 1, 0);
        let admin = client(1, PERM_ROLE_ADMIN);
        q.mark_pushed(0, &admin);
        q.mark_pushed(0, &admin);
        assert!(!q.needs_push(0, &admin));
    }

    #[test]
    fn full_queue_evicts_oldest_by_boot_then_millis() {
        let mut q = SystemMessageQueue::new();
        q.add("boot2 late", 2, 500);
        q.add("boot1 early", 1, 100);
        for i in 0..MAX_SYSTEM_MESSAGES - 2 {
            q.add(&format!("filler {i}"), 3, i as u32);
        }
        assert_eq!(q.len(), MAX_SYSTEM_MESSAGES);
        q.add("newest", 4, 0);
        assert_eq!(q.len(), MAX_SYSTEM_MESSAGES);
        assert!(!q.messages.iter().any(|m| m.text == "boot1 early"));
        assert!(q.messages.iter().any(|m| m.text == "boot2 late"));
    }

    #[test]
    fn cleanup_requires_every_admin_delivered() {
        let mut q = SystemMessageQueue::new();
        q.add("msg", 1, 0);
        let a = client(1, PERM_ROLE_ADMIN);
        let b = client(2, PERM_ROLE_ADMIN);

        let mut acl = ClientAcl::new();
        let ia = acl.put(a.id, PERM_ROLE_ADMIN);
        acl.get_mut(ia).unwrap().permissions = PERM_ROLE_ADMIN;
        let ib = acl.put(b.id, PERM_ROLE_ADMIN);
        acl.get_mut(ib).unwrap().permissions = PERM_ROLE_ADMIN;

        q.mark_pushed(0, &a);
        assert_eq!(q.cleanup(&acl), 0);
        q.mark_pushed(0, &b);
        assert_eq!(q.cleanup(&acl), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn cleanup_with_no_admins_removes_nothing() {
        let mut q = SystemMessageQueue::new();
        q.add("msg", 1, 0);
        let acl = ClientAcl::new();
        assert_eq!(q.cleanup(&acl), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn save_load_round_trip_keeps_delivered_sets() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();

        let mut q = SystemMessageQueue::new();
        q.add("SYSTEM: boot:3 msg:rebooted", 3, 42);
        q.add("SYSTEM: boot:3 msg:synced", 3, 99);
        let admin = client(1, PERM_ROLE_ADMIN);
        q.mark_pushed(0, &admin);
        q.save(&store).unwrap();

        let mut restored = SystemMessageQueue::new();
        restored.load(&store).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(0).unwrap().text, "SYSTEM: boot:3 msg:rebooted");
        assert_eq!(restored.get(0).unwrap().boot_sequence, 3);
        assert_eq!(restored.get(0).unwrap().created_millis, 42);
        assert!(!restored.needs_push(0, &admin));
        assert!(restored.needs_push(1, &admin));
    }
}
