//! Round-robin push scheduler.
//!
//! One client is considered per tick. A client with an unacknowledged push
//! in flight is skipped (`pending_ack != 0` is the per-client lock), so at
//! most one post or system message is outstanding per client at any time.
//! Three consecutive ACK timeouts evict a client from the push pool until
//! the replay gate sees a fresh inbound frame from it.

use log::debug;

use super::acl::ClientAcl;
use super::posts::PostBuffer;
use super::sysmsg::SystemMessageQueue;
use super::{
    ClockService, MAX_PRELOGIN_ATTEMPTS, MAX_PUSH_FAILURES, MAX_SYSTEM_MESSAGES,
    POST_SYNC_DELAY_SECS, PUSH_ACK_TIMEOUT_FACTOR, PUSH_ACK_TIMEOUT_FLOOD, PUSH_TIMEOUT_BASE,
    SYNC_PUSH_INTERVAL,
};
use crate::mesh::crypto::CryptoProvider;
use crate::mesh::wire;
use crate::mesh::{Identity, MeshTransport, PayloadType};
use crate::metrics;

/// Borrowed view of everything one scheduler tick mutates. The scheduler
/// never retains any of these across calls.
pub struct TickCtx<'a, T: MeshTransport, C: CryptoProvider> {
    pub acl: &'a mut ClientAcl,
    pub posts: &'a PostBuffer,
    pub sysmsgs: &'a SystemMessageQueue,
    pub clock: &'a ClockService,
    pub crypto: &'a C,
    pub transport: &'a mut T,
    pub self_id: Identity,
}

/// Outcome of a matched ACK.
#[derive(Debug)]
pub struct AckResult {
    pub client_idx: usize,
    /// Index of the system message this ACK confirmed, if any.
    pub delivered_sys_idx: Option<usize>,
}

/// Round-robin per-client push scheduler with ACK tracking.
pub struct PushScheduler {
    next_push: u64,
    next_client_idx: usize,
    /// Per-client index of the system message awaiting ACK.
    pending_sys: Vec<Option<usize>>,
    /// Per-client, per-message delivery attempts before first login.
    prelogin_attempts: Vec<[u8; MAX_SYSTEM_MESSAGES]>,
}

impl Default for PushScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PushScheduler {
    pub fn new() -> Self {
        Self {
            next_push: 0,
            next_client_idx: 0,
            pending_sys: Vec::new(),
            prelogin_attempts: Vec::new(),
        }
    }

    /// Run the next tick as soon as possible (new post, clock just synced).
    pub fn schedule_immediate(&mut self) {
        self.next_push = 0;
    }

    /// Hold off pushes until `now_ms + delay` (login response in flight).
    pub fn delay_push(&mut self, now_ms: u64, delay: u64) {
        self.next_push = now_ms + delay;
    }

    /// Zero the pre-login attempt counters for every system message for
    /// this client; called when an admin completes a login.
    pub fn reset_prelogin_attempts(&mut self, client_idx: usize) {
        self.grow_to(client_idx + 1);
        self.prelogin_attempts[client_idx] = [0; MAX_SYSTEM_MESSAGES];
    }

    fn grow_to(&mut self, len: usize) {
        while self.pending_sys.len() < len {
            self.pending_sys.push(None);
            self.prelogin_attempts.push([0; MAX_SYSTEM_MESSAGES]);
        }
    }

    /// Service the scheduler; runs at most one round-robin step when the
    /// push deadline has passed and the ACL is non-empty.
    pub fn tick<T: MeshTransport, C: CryptoProvider>(&mut self, ctx: &mut TickCtx<'_, T, C>) {
        let now_ms = ctx.clock.millis();
        if now_ms < self.next_push || ctx.acl.is_empty() {
            return;
        }
        self.grow_to(ctx.acl.len());

        // ACK timeout pass over every client
        for i in 0..ctx.acl.len() {
            let client = ctx.acl.get_mut(i).unwrap();
            if client.room.pending_ack != 0 && now_ms >= client.room.ack_timeout {
                client.room.pending_ack = 0;
                client.room.push_failures = client.room.push_failures.saturating_add(1);
                debug!(
                    "push ACK timed out for [{}], failures={}",
                    crate::logutil::hex_prefix(&client.id.pub_key),
                    client.room.push_failures
                );
                if self.pending_sys[i].take().is_some() {
                    debug!("system message push to [{}] will be retried",
                        crate::logutil::hex_prefix(&client.id.pub_key));
                }
            }
        }

        // round-robin body: one client per tick
        let ci = self.next_client_idx % ctx.acl.len();
        let mut did_push = false;

        let admin_idle = {
            let client = ctx.acl.get(ci).unwrap();
            client.room.pending_ack == 0 && client.is_admin()
        };
        if admin_idle {
            // system messages go to admins only, including not-yet-active
            // ones (bounded by the pre-login attempt budget)
            for mi in 0..ctx.sysmsgs.len() {
                if self.prelogin_attempts[ci][mi] >= MAX_PRELOGIN_ATTEMPTS {
                    continue;
                }
                if !ctx.sysmsgs.needs_push(mi, ctx.acl.get(ci).unwrap()) {
                    continue;
                }
                let text = ctx.sysmsgs.get(mi).unwrap().text.clone();
                let author = ctx.self_id;
                if self.emit_push(ctx, ci, 0, &author, text.as_bytes()) {
                    self.pending_sys[ci] = Some(mi);
                    self.prelogin_attempts[ci][mi] += 1;
                    debug!(
                        "system message {} pushed to admin [{}] (attempt {}/{})",
                        mi,
                        crate::logutil::hex_prefix(&ctx.acl.get(ci).unwrap().id.pub_key),
                        self.prelogin_attempts[ci][mi],
                        MAX_PRELOGIN_ATTEMPTS
                    );
                    did_push = true;
                }
                break;
            }
        }

        let client = ctx.acl.get(ci).unwrap();
        if !did_push
            && client.room.pending_ack == 0
            && client.last_activity != 0
            && client.room.push_failures < MAX_PUSH_FAILURES
        {
            let now = ctx.clock.now();
            let candidate = ctx
                .posts
                .iter_from_cursor()
                .find(|p| {
                    now >= p.post_timestamp.saturating_add(POST_SYNC_DELAY_SECS)
                        && p.post_timestamp > client.room.sync_since
                        && !p.author.matches(&client.id)
                })
                .map(|p| (p.post_timestamp, p.author, p.text.clone()));
            if let Some((ts, author, text)) = candidate {
                did_push = self.emit_push(ctx, ci, ts, &author, text.as_bytes());
                if did_push {
                    metrics::inc_post_pushes();
                }
            }
        }

        self.next_client_idx = (ci + 1) % ctx.acl.len();
        self.next_push = if did_push {
            now_ms + SYNC_PUSH_INTERVAL
        } else {
            // nothing for this client; move to the next one much sooner
            now_ms + SYNC_PUSH_INTERVAL / 8
        };
    }

    /// Build and transmit one push payload, arming the per-client ACK
    /// state. Returns false when the transport refuses the allocation (the
    /// push is abandoned for this tick).
    fn emit_push<T: MeshTransport, C: CryptoProvider>(
        &mut self,
        ctx: &mut TickCtx<'_, T, C>,
        client_idx: usize,
        post_timestamp: u32,
        author: &Identity,
        text: &[u8],
    ) -> bool {
        let mut attempt = [0u8; 1];
        ctx.crypto.random_bytes(&mut attempt);
        let payload = wire::build_push_payload(post_timestamp, attempt[0], author, text);

        let client = ctx.acl.get_mut(client_idx).unwrap();
        client.room.pending_ack = ctx.crypto.ack_token(&payload, &client.id);
        client.room.push_post_timestamp = post_timestamp;

        let pkt = ctx.transport.create_datagram(
            PayloadType::TxtMsg,
            &client.id,
            &client.shared_secret,
            &payload,
        );
        let Some(pkt) = pkt else {
            client.room.pending_ack = 0;
            metrics::inc_err_events();
            debug!("transport refused push allocation, will retry");
            return false;
        };

        let now_ms = ctx.clock.millis();
        match client.out_path.clone() {
            Some(path) => {
                client.room.ack_timeout = now_ms
                    + PUSH_TIMEOUT_BASE
                    + PUSH_ACK_TIMEOUT_FACTOR * (path.len() as u64 + 1);
                ctx.transport.send_direct(pkt, &path, 0);
            }
            None => {
                client.room.ack_timeout = now_ms + PUSH_ACK_TIMEOUT_FLOOD;
                ctx.transport.send_flood(pkt, 0);
            }
        }
        true
    }

    /// Match an inbound ACK token against every client's pending push.
    /// On a hit: clears the pending state, advances the client's sync
    /// cursor to the pushed timestamp, and retires a pending system message
    /// (the caller persists the queue when `delivered_sys_idx` is set).
    pub fn process_ack(
        &mut self,
        token: u32,
        acl: &mut ClientAcl,
        sysmsgs: &mut SystemMessageQueue,
    ) -> Option<AckResult> {
        if token == 0 {
            return None;
        }
        self.grow_to(acl.len());
        for i in 0..acl.len() {
            let client = acl.get_mut(i).unwrap();
            if client.room.pending_ack != token {
                continue;
            }
            client.room.pending_ack = 0;
            client.room.push_failures = 0;
            client.room.sync_since = client.room.push_post_timestamp;

            let delivered_sys_idx = self.pending_sys[i].take();
            if let Some(mi) = delivered_sys_idx {
                let client = acl.get(i).unwrap();
                sysmsgs.mark_pushed(mi, client);
                self.prelogin_attempts[i][mi] = 0;
                debug!(
                    "system message {} delivered to admin [{}]",
                    mi,
                    crate::logutil::hex_prefix(&client.id.pub_key)
                );
            }
            return Some(AckResult {
                client_idx: i,
                delivered_sys_idx,
            });
        }
        None
    }

    /// System message awaiting ACK for a client, if any.
    pub fn pending_sys_idx(&self, client_idx: usize) -> Option<usize> {
        self.pending_sys.get(client_idx).copied().flatten()
    }
}
