//! Server core: access control, post buffer, system messages, clock sync,
//! the push scheduler and the packet-handling session engine.
//!
//! Everything here runs on a single logical task. Packet handlers are
//! dispatched synchronously and must return before the next tick; there are
//! no locks because there is no inner parallelism.

pub mod acl;
pub mod channel;
pub mod clock;
pub mod commands;
pub mod netsync;
pub mod node;
pub mod posts;
pub mod scheduler;
pub mod session;
pub mod sysmsg;

pub use acl::{ClientAcl, ClientInfo};
pub use clock::{ClockService, ManualTime, SystemTimeSource, TimeSource};
pub use node::ServerNode;

/// Earliest believable wall-clock value: 2025-01-01T00:00:00Z. A clock
/// below this has never been set by an external source.
pub const MIN_VALID_TIMESTAMP: u32 = 1_735_689_600;

/// User message limit; severity prefixes are added on top.
pub const MAX_POST_TEXT_LEN: usize = 140;

/// Length of every bulletin severity prefix ("BLTN-INFO: " etc).
pub const SEVERITY_PREFIX_LEN: usize = 11;

/// Capacity of the cyclic post buffer.
pub const MAX_UNSYNCED_POSTS: usize = 32;

/// Capacity of the system message queue.
pub const MAX_SYSTEM_MESSAGES: usize = 8;

/// Upper bound on tracked clients.
pub const MAX_CLIENTS: usize = 32;

/// Guard word stamped at the end of persisted config blobs.
pub const CONFIG_GUARD: u32 = 0xDEAD_BEEF;

// Scheduler timing (milliseconds unless noted).
pub const REPLY_DELAY_MILLIS: u32 = 1500;
pub const PUSH_NOTIFY_DELAY_MILLIS: u64 = 2000;
pub const SYNC_PUSH_INTERVAL: u64 = 1200;
pub const PUSH_ACK_TIMEOUT_FLOOD: u64 = 12_000;
pub const PUSH_TIMEOUT_BASE: u64 = 4000;
pub const PUSH_ACK_TIMEOUT_FACTOR: u64 = 2000;
pub const POST_SYNC_DELAY_SECS: u32 = 6;
pub const LAZY_CONTACTS_WRITE_DELAY: u64 = 5000;
pub const SERVER_RESPONSE_DELAY: u32 = 300;
pub const TXT_ACK_DELAY: u32 = 200;
pub const BULLETIN_RATE_LIMIT_MILLIS: u64 = 10_000;
pub const SYS_MSG_CLEANUP_INTERVAL: u64 = 60_000;

/// Consecutive push timeouts after which a client is evicted from the push
/// pool until it is heard from again.
pub const MAX_PUSH_FAILURES: u8 = 3;

/// Pre-login delivery attempts allowed per (admin, system message) pair.
pub const MAX_PRELOGIN_ATTEMPTS: u8 = 3;

// Role bits, low three bits of the permissions byte. Values are chosen so
// that OR-ing a newly granted role into an existing entry can only widen it.
pub const PERM_ROLE_MASK: u8 = 0b0000_0111;
pub const PERM_ROLE_GUEST: u8 = 0b0000_0001;
pub const PERM_ROLE_READ_ONLY: u8 = 0b0000_0010;
pub const PERM_ROLE_READ_WRITE: u8 = 0b0000_0011;
pub const PERM_ROLE_ADMIN: u8 = 0b0000_0111;

/// Bulletin severity levels for console-originated posts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostSeverity {
    Info,
    Warning,
    Critical,
}

impl PostSeverity {
    pub fn prefix(self) -> &'static str {
        match self {
            PostSeverity::Info => "BLTN-INFO: ",
            PostSeverity::Warning => "BLTN-WARN: ",
            PostSeverity::Critical => "BLTN-CRIT: ",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PostSeverity::Info => "info",
            PostSeverity::Warning => "warning",
            PostSeverity::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_prefixes_share_length() {
        for sev in [
            PostSeverity::Info,
            PostSeverity::Warning,
            PostSeverity::Critical,
        ] {
            assert_eq!(sev.prefix().len(), SEVERITY_PREFIX_LEN);
        }
    }

    #[test]
    fn role_or_growth_is_monotone() {
        // guest | read_write == read_write, read_write | admin == admin
        assert_eq!(PERM_ROLE_GUEST | PERM_ROLE_READ_WRITE, PERM_ROLE_READ_WRITE);
        assert_eq!(PERM_ROLE_READ_WRITE | PERM_ROLE_ADMIN, PERM_ROLE_ADMIN);
    }
}
