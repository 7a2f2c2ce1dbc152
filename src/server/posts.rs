//! Cyclic post buffer.
//!
//! Fixed capacity: new posts overwrite the oldest slot once the buffer has
//! wrapped. Slots with `post_timestamp == 0` are empty (or carry a
//! transient system message when used as an outbound payload) and are
//! skipped by iteration and persistence.

use anyhow::{bail, Result};

use super::{ClockService, MAX_UNSYNCED_POSTS};
use crate::mesh::{Identity, PUB_KEY_SIZE};
use crate::server::acl::ClientInfo;
use crate::storage::BlobStore;

/// Logical blob name of the persisted buffer.
pub const POSTS_FILE: &str = "/posts";

const POSTS_FORMAT_V1: u8 = 1;

/// One bulletin post. `post_timestamp` is by *our* clock and unique; 0 is
/// the reserved "empty / system carrier" sentinel.
#[derive(Clone, Debug, Default)]
pub struct PostInfo {
    pub author: Identity,
    pub post_timestamp: u32,
    pub text: String,
}

/// Fixed-size cyclic queue of posts.
pub struct PostBuffer {
    posts: Vec<PostInfo>,
    next_idx: usize,
}

impl Default for PostBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PostBuffer {
    pub fn new() -> Self {
        Self {
            posts: vec![PostInfo::default(); MAX_UNSYNCED_POSTS],
            next_idx: 0,
        }
    }

    /// Append a post with a fresh unique timestamp, overwriting the slot at
    /// the write cursor. Returns the assigned timestamp.
    pub fn append(&mut self, author: Identity, text: &str, clock: &mut ClockService) -> u32 {
        let timestamp = clock.now_unique();
        self.posts[self.next_idx] = PostInfo {
            author,
            post_timestamp: timestamp,
            text: text.to_string(),
        };
        self.next_idx = (self.next_idx + 1) % MAX_UNSYNCED_POSTS;
        timestamp
    }

    /// Write cursor; the newest post sits at `(next_idx - 1) mod N`.
    pub fn next_idx(&self) -> usize {
        self.next_idx
    }

    /// Iterate valid posts newest-first.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &PostInfo> {
        (1..=MAX_UNSYNCED_POSTS)
            .map(move |back| {
                &self.posts[(self.next_idx + MAX_UNSYNCED_POSTS - back) % MAX_UNSYNCED_POSTS]
            })
            .filter(|p| p.post_timestamp > 0)
    }

    /// Iterate all slots starting at the write cursor (oldest-first in a
    /// full buffer). The scheduler uses this to deliver in rough
    /// chronological order.
    pub fn iter_from_cursor(&self) -> impl Iterator<Item = &PostInfo> {
        (0..MAX_UNSYNCED_POSTS)
            .map(move |k| &self.posts[(self.next_idx + k) % MAX_UNSYNCED_POSTS])
    }

    /// Posts this client has not yet confirmed, excluding its own.
    pub fn count_unsynced_for(&self, client: &ClientInfo) -> u8 {
        self.posts
            .iter()
            .filter(|p| p.post_timestamp > client.room.sync_since && !p.author.matches(&client.id))
            .count() as u8
    }

    /// Persist the buffer (v1 layout): version byte, 4-byte write cursor,
    /// then one variable-length record per non-empty slot.
    pub fn save(&self, store: &BlobStore) -> Result<()> {
        let mut out = Vec::new();
        out.push(POSTS_FORMAT_V1);
        out.extend_from_slice(&(self.next_idx as u32).to_le_bytes());
        for post in self.posts.iter().filter(|p| p.post_timestamp > 0) {
            out.extend_from_slice(&post.author.pub_key);
            out.extend_from_slice(&post.post_timestamp.to_le_bytes());
            let text = post.text.as_bytes();
            out.push(text.len() as u8);
            out.extend_from_slice(text);
        }
        store.write_all(POSTS_FILE, &out)
    }

    /// Restore from the persisted image; absent file leaves the buffer
    /// empty. Truncated records stop the load at the last good one.
    pub fn load(&mut self, store: &BlobStore) -> Result<()> {
        *self = Self::new();
        if !store.exists(POSTS_FILE) {
            return Ok(());
        }
        let bytes = store.read_all(POSTS_FILE)?;
        if bytes.len() < 5 || bytes[0] != POSTS_FORMAT_V1 {
            bail!("posts blob has unknown format");
        }
        self.next_idx =
            u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize % MAX_UNSYNCED_POSTS;

        let mut pos = 5;
        let mut slot = 0;
        while slot < MAX_UNSYNCED_POSTS && pos + PUB_KEY_SIZE + 5 <= bytes.len() {
            let mut key = [0u8; PUB_KEY_SIZE];
            key.copy_from_slice(&bytes[pos..pos + PUB_KEY_SIZE]);
            pos += PUB_KEY_SIZE;
            let timestamp =
                u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
            pos += 4;
            let text_len = bytes[pos] as usize;
            pos += 1;
            if pos + text_len > bytes.len() {
                break;
            }
            let text = String::from_utf8_lossy(&bytes[pos..pos + text_len]).into_owned();
            pos += text_len;
            self.posts[slot] = PostInfo {
                author: Identity::new(key),
                post_timestamp: timestamp,
                text,
            };
            slot += 1;
        }
        Ok(())
    }
}
