//! The server node: owns all core state and drives it from `loop_tick()`.
//!
//! Inbound frames mutate state synchronously via the session handlers in
//! [`super::session`]; the periodic tick services clock-sync checks, the
//! push scheduler, the lazy ACL write and system-message cleanup. Every
//! persistence failure is logged and recovered locally - nothing here
//! aborts a tick.

use anyhow::{Context, Result};
use log::{debug, info, warn};

use super::acl::{ClientAcl, ClientInfo, ACL_RECORD_LEN, CONTACTS_FILE};
use super::channel::{ChannelState, CHANNEL_CONFIG_FILE};
use super::netsync::{ClockSyncEngine, NETSYNC_CONFIG_FILE};
use super::posts::PostBuffer;
use super::scheduler::{PushScheduler, TickCtx};
use super::sysmsg::SystemMessageQueue;
use super::{
    ClockService, PostSeverity, BULLETIN_RATE_LIMIT_MILLIS, PUSH_NOTIFY_DELAY_MILLIS,
    SYS_MSG_CLEANUP_INTERVAL,
};
use crate::config::Config;
use crate::logutil::hex_prefix;
use crate::mesh::crypto::CryptoProvider;
use crate::mesh::wire::{ServerStatus, TXT_TYPE_PLAIN};
use crate::mesh::{Identity, LocalIdentity, MeshTransport, MAX_PACKET_PAYLOAD};
use crate::metrics;
use crate::storage::{identity, BlobRule, BlobStore};

/// Logical blob names owned directly by the node.
pub const BOOT_COUNT_FILE: &str = "/boot_count";
pub const PACKET_LOG_FILE: &str = "/packet_log";

/// One remembered login (runtime only).
#[derive(Clone, Copy, Debug)]
pub struct LoginRecord {
    pub prefix: [u8; 4],
    pub timestamp: u32,
    pub permissions: u8,
}

/// Last five logins, newest first.
#[derive(Default)]
pub struct LoginHistory {
    entries: Vec<LoginRecord>,
}

impl LoginHistory {
    const CAPACITY: usize = 5;

    pub fn record(&mut self, prefix: [u8; 4], timestamp: u32, permissions: u8) {
        self.entries.insert(
            0,
            LoginRecord {
                prefix,
                timestamp,
                permissions,
            },
        );
        self.entries.truncate(Self::CAPACITY);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoginRecord> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bulletin-board server node.
pub struct ServerNode<T: MeshTransport, C: CryptoProvider> {
    pub(crate) config: Config,
    pub(crate) identity: LocalIdentity,
    pub(crate) clock: ClockService,
    pub(crate) store: BlobStore,
    pub(crate) acl: ClientAcl,
    pub(crate) posts: PostBuffer,
    pub(crate) system_msgs: SystemMessageQueue,
    pub(crate) netsync: ClockSyncEngine,
    pub(crate) channel: ChannelState,
    pub(crate) scheduler: PushScheduler,
    pub(crate) transport: T,
    pub(crate) crypto: C,
    pub(crate) boot_sequence: u32,
    pub(crate) dirty_contacts_expiry: u64,
    pub(crate) last_bulletin_millis: u64,
    next_sysmsg_cleanup: u64,
    pub(crate) login_history: LoginHistory,
    pub(crate) packet_logging: bool,
}

impl<T: MeshTransport, C: CryptoProvider> ServerNode<T, C> {
    /// Create the node, loading (or generating) its long-term identity.
    /// Call [`ServerNode::begin`] before feeding it frames.
    pub fn new(
        config: Config,
        store: BlobStore,
        transport: T,
        crypto: C,
        clock: ClockService,
    ) -> Result<Self> {
        let identity =
            identity::load_or_create(&store, &crypto).context("loading node identity")?;
        Ok(Self {
            config,
            identity,
            clock,
            store,
            acl: ClientAcl::new(),
            posts: PostBuffer::new(),
            system_msgs: SystemMessageQueue::new(),
            netsync: ClockSyncEngine::new(),
            channel: ChannelState::new(),
            scheduler: PushScheduler::new(),
            transport,
            crypto,
            boot_sequence: 0,
            dirty_contacts_expiry: 0,
            last_bulletin_millis: 0,
            next_sysmsg_cleanup: 0,
            login_history: LoginHistory::default(),
            packet_logging: false,
        })
    }

    /// Load all persisted state and announce the boot. A desynced clock at
    /// boot queues the read-only notice for admins.
    pub fn begin(&mut self) -> Result<()> {
        // pull mirror copies over any unusable primaries first
        self.store
            .restore_if_invalid(CONTACTS_FILE, &BlobRule::aligned(ACL_RECORD_LEN));
        self.store
            .restore_if_invalid(NETSYNC_CONFIG_FILE, &ClockSyncEngine::blob_rule());
        self.store
            .restore_if_invalid(CHANNEL_CONFIG_FILE, &ChannelState::blob_rule());

        self.boot_sequence = self.load_boot_counter().wrapping_add(1);
        if let Err(e) = self
            .store
            .write_all(BOOT_COUNT_FILE, &self.boot_sequence.to_le_bytes())
        {
            warn!("boot counter not persisted: {e:#}");
        }

        if let Err(e) = self.acl.load(&self.store) {
            warn!("contacts not loaded: {e:#}");
        }
        if let Err(e) = self.posts.load(&self.store) {
            warn!("posts not loaded: {e:#}");
        }
        if let Err(e) = self.system_msgs.load(&self.store) {
            warn!("system messages not loaded: {e:#}");
        }
        if let Err(e) = self.netsync.load_config(&self.store) {
            warn!("{e:#}");
        }
        match self.channel.load(&self.store) {
            Ok(true) => {}
            Ok(false) => {
                // first boot or bad guard: persist public-mode defaults
                if let Err(e) = self.channel.save(&self.store) {
                    warn!("channel config not persisted: {e:#}");
                }
            }
            Err(e) => warn!("channel config not loaded: {e:#}"),
        }
        self.channel.initialise(&self.identity.id, &self.crypto);

        for name in [CONTACTS_FILE, CHANNEL_CONFIG_FILE, NETSYNC_CONFIG_FILE] {
            self.store.backup(name);
        }

        info!(
            "node [{}] boot {} - {} clients, {} posts, {} system messages",
            hex_prefix(&self.identity.id.pub_key),
            self.boot_sequence,
            self.acl.len(),
            self.posts.iter_newest_first().count(),
            self.system_msgs.len()
        );

        if self.clock.is_desynced() {
            self.add_system_message("Server rebooted. Clock desynced - read-only until admin login.");
        }
        Ok(())
    }

    fn load_boot_counter(&self) -> u32 {
        if !self.store.exists(BOOT_COUNT_FILE) {
            return 0;
        }
        match self.store.read_all(BOOT_COUNT_FILE) {
            Ok(bytes) if bytes.len() >= 4 => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            _ => 0,
        }
    }

    /// Queue a system message, stamped with the boot number so companion
    /// apps can deduplicate across reboots.
    pub fn add_system_message(&mut self, message: &str) {
        let formatted = format!("SYSTEM: boot:{} msg:{}", self.boot_sequence, message);
        info!("system message queued: {}", crate::logutil::escape_log(&formatted));
        self.system_msgs
            .add(&formatted, self.boot_sequence, self.clock.millis() as u32);
        if let Err(e) = self.system_msgs.save(&self.store) {
            warn!("system messages not persisted: {e:#}");
        }
    }

    /// Record a mesh-originated post and wake the scheduler.
    pub(crate) fn add_post(&mut self, author: Identity, text: &str) -> u32 {
        let timestamp = self.posts.append(author, text, &mut self.clock);
        metrics::inc_posts_created();
        info!(
            "post from [{}] at {}: {}",
            hex_prefix(&author.pub_key),
            timestamp,
            crate::logutil::escape_log(text)
        );
        self.scheduler
            .delay_push(self.clock.millis(), PUSH_NOTIFY_DELAY_MILLIS);
        if let Err(e) = self.posts.save(&self.store) {
            warn!("posts not persisted: {e:#}");
        }
        timestamp
    }

    /// Console-originated bulletin with severity prefix. Length and rate
    /// limits are enforced by the CLI layer; this only records and fans out.
    pub(crate) fn add_bulletin(&mut self, text: &str, severity: PostSeverity) {
        let prefixed = format!("{}{}", severity.prefix(), text);
        let timestamp = self
            .posts
            .append(self.identity.id, &prefixed, &mut self.clock);
        metrics::inc_posts_created();
        info!(
            "{} bulletin at {}: {}",
            severity.name(),
            timestamp,
            crate::logutil::escape_log(text)
        );
        self.scheduler
            .delay_push(self.clock.millis(), PUSH_NOTIFY_DELAY_MILLIS);

        if matches!(severity, PostSeverity::Warning | PostSeverity::Critical) {
            self.broadcast_bulletin(text, severity);
        }
        if let Err(e) = self.posts.save(&self.store) {
            warn!("posts not persisted: {e:#}");
        }
    }

    /// Broadcast a warning/critical bulletin on the group channel.
    fn broadcast_bulletin(&mut self, text: &str, severity: PostSeverity) {
        if !self.channel.is_initialised() {
            warn!("cannot broadcast bulletin - channel not initialised");
            return;
        }
        let mut payload = Vec::with_capacity(MAX_PACKET_PAYLOAD);
        payload.extend_from_slice(&self.clock.now().to_le_bytes());
        payload.push(TXT_TYPE_PLAIN << 2);
        payload.extend_from_slice(self.config.node.name.as_bytes());
        payload.extend_from_slice(b": ");
        payload.extend_from_slice(severity.prefix().as_bytes());
        payload.extend_from_slice(text.as_bytes());
        payload.truncate(MAX_PACKET_PAYLOAD);

        match self
            .transport
            .create_group_datagram(self.channel.runtime(), &payload)
        {
            Some(pkt) => {
                self.transport.send_flood(pkt, 0);
                debug!("broadcast {} bulletin to channel", severity.name());
            }
            None => {
                metrics::inc_err_events();
                warn!("transport refused bulletin broadcast allocation");
            }
        }
    }

    pub(crate) fn check_bulletin_rate_limit(&self) -> Result<(), u64> {
        if self.last_bulletin_millis == 0 {
            return Ok(());
        }
        let elapsed = self.clock.millis().saturating_sub(self.last_bulletin_millis);
        if elapsed < BULLETIN_RATE_LIMIT_MILLIS {
            Err((BULLETIN_RATE_LIMIT_MILLIS - elapsed) / 1000)
        } else {
            Ok(())
        }
    }

    /// Notification after the clock was set by an external source.
    pub(crate) fn notify_clock_synced(&mut self, admin_prefix: Option<[u8; 4]>) {
        let msg = match admin_prefix {
            Some(prefix) => format!(
                "Clock synced by admin [{}]. Server now in read-write mode.",
                crate::logutil::hex_full(&prefix)
            ),
            None => "Clock synced manually. Server now in read-write mode.".to_string(),
        };
        self.add_system_message(&msg);
        self.scheduler.schedule_immediate();
    }

    fn notify_clock_synced_from_repeaters(&mut self, sync: &super::netsync::QuorumSync) {
        let when = chrono::DateTime::from_timestamp(sync.timestamp as i64, 0)
            .map(|dt| dt.format("%d %b %Y %H:%M").to_string())
            .unwrap_or_else(|| sync.timestamp.to_string());
        let quorum = sync
            .quorum_prefixes
            .iter()
            .map(|p| format!("[{}]", crate::logutil::hex_full(p)))
            .collect::<Vec<_>>()
            .join(", ");
        let msg = format!(
            "Clock set by Repeater advert from [{}] to {}. Quorum nodes: {}.",
            crate::logutil::hex_full(&sync.winner_prefix),
            when,
            quorum
        );
        self.add_system_message(&msg);
        self.scheduler.schedule_immediate();
    }

    /// Route an ACK token into the scheduler; persists the system message
    /// queue when the ACK retired one.
    pub(crate) fn process_ack(&mut self, token: u32) -> bool {
        match self
            .scheduler
            .process_ack(token, &mut self.acl, &mut self.system_msgs)
        {
            Some(result) => {
                if result.delivered_sys_idx.is_some() {
                    if let Err(e) = self.system_msgs.save(&self.store) {
                        warn!("system messages not persisted: {e:#}");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Defer the ACL write; repeated mutations within the window extend it.
    pub(crate) fn schedule_lazy_contacts_write(&mut self) {
        self.dirty_contacts_expiry =
            self.clock.millis() + super::LAZY_CONTACTS_WRITE_DELAY;
    }

    /// Canonical persistence policy: admins only.
    pub fn save_filter(client: &ClientInfo) -> bool {
        client.is_admin()
    }

    pub(crate) fn save_contacts_now(&mut self) {
        if let Err(e) = self.acl.save(&self.store, Self::save_filter) {
            warn!("contacts not persisted: {e:#}");
        }
        self.store.backup(CONTACTS_FILE);
        self.dirty_contacts_expiry = 0;
    }

    /// One cooperative tick: clock-sync check, scheduler service, lazy
    /// writes, periodic cleanup.
    pub fn loop_tick(&mut self) {
        if self.netsync.check_pending() {
            if let Some(sync) = self.netsync.service_check(&mut self.clock) {
                self.notify_clock_synced_from_repeaters(&sync);
            }
        }

        let mut ctx = TickCtx {
            acl: &mut self.acl,
            posts: &self.posts,
            sysmsgs: &self.system_msgs,
            clock: &self.clock,
            crypto: &self.crypto,
            transport: &mut self.transport,
            self_id: self.identity.id,
        };
        self.scheduler.tick(&mut ctx);

        let now_ms = self.clock.millis();
        if self.dirty_contacts_expiry != 0 && now_ms >= self.dirty_contacts_expiry {
            self.save_contacts_now();
        }

        if now_ms >= self.next_sysmsg_cleanup {
            let removed = self.system_msgs.cleanup(&self.acl);
            if removed > 0 {
                debug!("system message cleanup removed {removed}");
                if let Err(e) = self.system_msgs.save(&self.store) {
                    warn!("system messages not persisted: {e:#}");
                }
            }
            self.next_sysmsg_cleanup = now_ms + SYS_MSG_CLEANUP_INTERVAL;
        }
    }

    /// Append a line to the packet log when logging is enabled.
    pub(crate) fn packet_log(&self, line: &str) {
        if !self.packet_logging {
            return;
        }
        let stamped = format!("{}: {}\n", self.clock.now(), line);
        if let Err(e) = self.store.append(PACKET_LOG_FILE, stamped.as_bytes()) {
            warn!("packet log append failed: {e:#}");
        }
    }

    /// Fill the packed status struct for a `GET_STATUS` request.
    pub(crate) fn status_snapshot(&self) -> ServerStatus {
        let link = self.transport.link_stats();
        let m = metrics::snapshot();
        ServerStatus {
            batt_milli_volts: link.batt_milli_volts,
            curr_tx_queue_len: self.transport.outbound_queue_len() as u16,
            noise_floor: link.noise_floor,
            last_rssi: link.last_rssi,
            n_packets_recv: m.packets_recv,
            n_packets_sent: m.packets_sent,
            total_air_time_secs: link.air_time_secs,
            total_up_time_secs: (self.clock.millis() / 1000) as u32,
            n_sent_flood: m.sent_flood,
            n_sent_direct: m.sent_direct,
            n_recv_flood: m.recv_flood,
            n_recv_direct: m.recv_direct,
            err_events: m.err_events as u16,
            last_snr_x4: link.last_snr_x4,
            n_direct_dups: link.direct_dups,
            n_flood_dups: link.flood_dups,
            n_posted: m.posts_created as u16,
            n_post_push: m.post_pushes as u16,
        }
    }

    // accessors (used by the host loop, the console, and tests)

    pub fn identity(&self) -> &Identity {
        &self.identity.id
    }

    pub fn clock(&self) -> &ClockService {
        &self.clock
    }

    pub fn acl(&self) -> &ClientAcl {
        &self.acl
    }

    pub fn posts(&self) -> &PostBuffer {
        &self.posts
    }

    pub fn system_msgs(&self) -> &SystemMessageQueue {
        &self.system_msgs
    }

    pub fn netsync(&self) -> &ClockSyncEngine {
        &self.netsync
    }

    pub fn scheduler(&self) -> &PushScheduler {
        &self.scheduler
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn boot_sequence(&self) -> u32 {
        self.boot_sequence
    }

    pub fn login_history(&self) -> &LoginHistory {
        &self.login_history
    }
}
