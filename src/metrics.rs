//! Node-level counters backing the `GET_STATUS` reply.
//!
//! Plain atomics with relaxed ordering; the core is single-threaded but the
//! transport may tick counters from its own context.

use std::sync::atomic::{AtomicU32, Ordering};

static PACKETS_RECV: AtomicU32 = AtomicU32::new(0);
static PACKETS_SENT: AtomicU32 = AtomicU32::new(0);
static SENT_FLOOD: AtomicU32 = AtomicU32::new(0);
static SENT_DIRECT: AtomicU32 = AtomicU32::new(0);
static RECV_FLOOD: AtomicU32 = AtomicU32::new(0);
static RECV_DIRECT: AtomicU32 = AtomicU32::new(0);
static ERR_EVENTS: AtomicU32 = AtomicU32::new(0);
static POSTS_CREATED: AtomicU32 = AtomicU32::new(0);
static POST_PUSHES: AtomicU32 = AtomicU32::new(0);

pub fn inc_recv_flood() {
    PACKETS_RECV.fetch_add(1, Ordering::Relaxed);
    RECV_FLOOD.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_recv_direct() {
    PACKETS_RECV.fetch_add(1, Ordering::Relaxed);
    RECV_DIRECT.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_sent_flood() {
    PACKETS_SENT.fetch_add(1, Ordering::Relaxed);
    SENT_FLOOD.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_sent_direct() {
    PACKETS_SENT.fetch_add(1, Ordering::Relaxed);
    SENT_DIRECT.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_err_events() {
    ERR_EVENTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_posts_created() {
    POSTS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_post_pushes() {
    POST_PUSHES.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of all counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub packets_recv: u32,
    pub packets_sent: u32,
    pub sent_flood: u32,
    pub sent_direct: u32,
    pub recv_flood: u32,
    pub recv_direct: u32,
    pub err_events: u32,
    pub posts_created: u32,
    pub post_pushes: u32,
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        packets_recv: PACKETS_RECV.load(Ordering::Relaxed),
        packets_sent: PACKETS_SENT.load(Ordering::Relaxed),
        sent_flood: SENT_FLOOD.load(Ordering::Relaxed),
        sent_direct: SENT_DIRECT.load(Ordering::Relaxed),
        recv_flood: RECV_FLOOD.load(Ordering::Relaxed),
        recv_direct: RECV_DIRECT.load(Ordering::Relaxed),
        err_events: ERR_EVENTS.load(Ordering::Relaxed),
        posts_created: POSTS_CREATED.load(Ordering::Relaxed),
        post_pushes: POST_PUSHES.load(Ordering::Relaxed),
    }
}

/// Reset every counter (CLI `clear stats` and tests).
pub fn reset() {
    PACKETS_RECV.store(0, Ordering::Relaxed);
    PACKETS_SENT.store(0, Ordering::Relaxed);
    SENT_FLOOD.store(0, Ordering::Relaxed);
    SENT_DIRECT.store(0, Ordering::Relaxed);
    RECV_FLOOD.store(0, Ordering::Relaxed);
    RECV_DIRECT.store(0, Ordering::Relaxed);
    ERR_EVENTS.store(0, Ordering::Relaxed);
    POSTS_CREATED.store(0, Ordering::Relaxed);
    POST_PUSHES.store(0, Ordering::Relaxed);
}
