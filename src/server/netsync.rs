//! Network time synchronisation engine.
//!
//! Two producers race to set the wall clock once per boot:
//!
//! 1. **Admin source** - the first authenticated admin packet carrying a
//!    believable sender timestamp wins outright.
//! 2. **Repeater quorum** - when enabled, three repeater advertisements
//!    whose clocks agree within the configured window; the newest of the
//!    three wins. A majority-of-three liveness heuristic, not consensus.
//!
//! `synced_once` is runtime-only and resets at reboot; the enable flag and
//! agreement window persist with a guard word.

use anyhow::{bail, Result};
use log::{debug, info};

use super::{ClockService, CONFIG_GUARD, MIN_VALID_TIMESTAMP};
use crate::mesh::Identity;
use crate::storage::{BlobRule, BlobStore};

/// Logical blob name of the persisted config.
pub const NETSYNC_CONFIG_FILE: &str = "/netsync_cfg";

/// Persisted blob length: enabled u8 + maxwait u16 + guard u32.
pub const NETSYNC_CONFIG_LEN: usize = 7;

const QUORUM_SIZE: usize = 3;

pub const DEFAULT_MAXWAIT_MINS: u16 = 15;
pub const MAXWAIT_RANGE: std::ops::RangeInclusive<u16> = 5..=60;

/// Persistent configuration.
#[derive(Clone, Copy, Debug)]
pub struct NetSyncConfig {
    pub enabled: bool,
    pub maxwait_mins: u16,
}

impl Default for NetSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            maxwait_mins: DEFAULT_MAXWAIT_MINS,
        }
    }
}

/// One buffered repeater advertisement.
#[derive(Clone, Copy, Debug)]
struct RepeaterAdvert {
    prefix: [u8; 4],
    timestamp: u32,
    received_time: u32,
}

/// Result of a successful quorum sync, for operator notification.
#[derive(Debug)]
pub struct QuorumSync {
    pub winner_prefix: [u8; 4],
    pub timestamp: u32,
    pub quorum_prefixes: Vec<[u8; 4]>,
}

/// Clock-sync state machine.
pub struct ClockSyncEngine {
    config: NetSyncConfig,
    synced_once: bool,
    repeaters: Vec<RepeaterAdvert>,
    check_flag: bool,
}

impl Default for ClockSyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSyncEngine {
    pub fn new() -> Self {
        Self {
            config: NetSyncConfig::default(),
            synced_once: false,
            repeaters: Vec::with_capacity(QUORUM_SIZE),
            check_flag: false,
        }
    }

    pub fn synced_once(&self) -> bool {
        self.synced_once
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn maxwait_mins(&self) -> u16 {
        self.config.maxwait_mins
    }

    pub fn repeater_count(&self) -> usize {
        self.repeaters.len()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Set the agreement window; out-of-range values are rejected.
    pub fn set_maxwait_mins(&mut self, mins: u16) -> bool {
        if !MAXWAIT_RANGE.contains(&mins) {
            return false;
        }
        self.config.maxwait_mins = mins;
        true
    }

    /// Admin-source sync: sets the clock from the first admin packet with a
    /// believable timestamp, invalidating any repeater progress. Returns
    /// true when the clock was set.
    pub fn admin_source_sync(&mut self, clock: &mut ClockService, sender_timestamp: u32) -> bool {
        if self.synced_once || !clock.is_desynced() {
            return false;
        }
        if sender_timestamp < MIN_VALID_TIMESTAMP {
            debug!(
                "admin timestamp {} below minimum believable {}",
                sender_timestamp, MIN_VALID_TIMESTAMP
            );
            return false;
        }
        clock.set(sender_timestamp);
        self.synced_once = true;
        self.repeaters.clear();
        self.check_flag = false;
        true
    }

    /// A CLI `time` command (or similar) set the clock directly; record the
    /// sync and drop repeater progress.
    pub fn mark_synced_manually(&mut self) {
        self.synced_once = true;
        self.repeaters.clear();
        self.check_flag = false;
    }

    /// Record a repeater advertisement. Same-prefix adverts keep the newer
    /// timestamp; a full buffer evicts the entry oldest by local receive
    /// time. A *new* entry arms the quorum check for the next tick.
    pub fn on_repeater_advert(&mut self, sender: &Identity, timestamp: u32, clock: &ClockService) {
        if self.synced_once || !clock.is_desynced() || !self.config.enabled {
            return;
        }
        if timestamp < MIN_VALID_TIMESTAMP {
            debug!(
                "repeater [{}] advert timestamp {} too old, ignored",
                crate::logutil::hex_prefix(&sender.pub_key),
                timestamp
            );
            return;
        }

        let prefix = sender.prefix4();
        let now = clock.now();
        if let Some(existing) = self.repeaters.iter_mut().find(|r| r.prefix == prefix) {
            if timestamp > existing.timestamp {
                existing.timestamp = timestamp;
                existing.received_time = now;
            }
            return;
        }

        if self.repeaters.len() >= QUORUM_SIZE {
            if let Some(oldest) = self
                .repeaters
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.received_time)
                .map(|(i, _)| i)
            {
                self.repeaters.remove(oldest);
            }
        }
        self.repeaters.push(RepeaterAdvert {
            prefix,
            timestamp,
            received_time: now,
        });
        debug!(
            "repeater [{}] buffered ({}/{QUORUM_SIZE}), timestamp {}",
            crate::logutil::hex_prefix(&prefix),
            self.repeaters.len(),
            timestamp
        );
        self.check_flag = true;
    }

    pub fn check_pending(&self) -> bool {
        self.check_flag
    }

    /// Service one armed quorum check. At most one check runs per tick; the
    /// flag is consumed regardless of outcome. Returns details when the
    /// clock was synced.
    pub fn service_check(&mut self, clock: &mut ClockService) -> Option<QuorumSync> {
        if !self.check_flag {
            return None;
        }
        self.check_flag = false;

        if self.synced_once || !self.config.enabled {
            return None;
        }

        let now = clock.now();
        let maxwait_secs = self.config.maxwait_mins as u32 * 60;

        // Age out entries once our own clock is believable enough to judge.
        if now > MIN_VALID_TIMESTAMP {
            self.repeaters
                .retain(|r| now <= r.received_time.saturating_add(maxwait_secs));
        }
        if self.repeaters.len() < QUORUM_SIZE {
            return None;
        }

        let min_ts = self.repeaters.iter().map(|r| r.timestamp).min().unwrap();
        let (max_idx, max_ts) = self
            .repeaters
            .iter()
            .enumerate()
            .max_by_key(|(_, r)| r.timestamp)
            .map(|(i, r)| (i, r.timestamp))
            .unwrap();

        if max_ts - min_ts > maxwait_secs {
            // disagreement too large; drop the entry oldest by receive time
            // and wait for a fresh advert
            if let Some(oldest) = self
                .repeaters
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.received_time)
                .map(|(i, _)| i)
            {
                debug!(
                    "quorum span {}s exceeds {}s, dropping [{}]",
                    max_ts - min_ts,
                    maxwait_secs,
                    crate::logutil::hex_prefix(&self.repeaters[oldest].prefix)
                );
                self.repeaters.remove(oldest);
            }
            return None;
        }

        // The winning timestamp must move our clock forward when the clock
        // is already believable; otherwise the whole buffer is bogus.
        if now > MIN_VALID_TIMESTAMP && max_ts <= now {
            debug!("quorum timestamp {max_ts} not ahead of clock {now}, discarding buffer");
            self.repeaters.clear();
            return None;
        }

        let result = QuorumSync {
            winner_prefix: self.repeaters[max_idx].prefix,
            timestamp: max_ts,
            quorum_prefixes: self.repeaters.iter().map(|r| r.prefix).collect(),
        };
        clock.set(max_ts);
        self.synced_once = true;
        self.repeaters.clear();
        info!(
            "clock set to {} by repeater quorum, winner [{}]",
            result.timestamp,
            crate::logutil::hex_prefix(&result.winner_prefix)
        );
        Some(result)
    }

    /// Persist `{enabled, maxwait_mins, guard}`.
    pub fn save_config(&self, store: &BlobStore) -> Result<()> {
        let mut out = Vec::with_capacity(NETSYNC_CONFIG_LEN);
        out.push(self.config.enabled as u8);
        out.extend_from_slice(&self.config.maxwait_mins.to_le_bytes());
        out.extend_from_slice(&CONFIG_GUARD.to_le_bytes());
        store.write_all(NETSYNC_CONFIG_FILE, &out)
    }

    /// Load the persisted config. A bad guard word or out-of-range window
    /// leaves the defaults in place.
    pub fn load_config(&mut self, store: &BlobStore) -> Result<()> {
        if !store.exists(NETSYNC_CONFIG_FILE) {
            return Ok(());
        }
        let bytes = store.read_all(NETSYNC_CONFIG_FILE)?;
        match parse_config(&bytes) {
            Some(config) => {
                self.config = config;
                Ok(())
            }
            None => bail!("invalid network time sync config, using defaults"),
        }
    }

    /// Validation rule for mirror restore.
    pub fn blob_rule() -> BlobRule {
        BlobRule::guarded(NETSYNC_CONFIG_LEN, CONFIG_GUARD)
    }
}

fn parse_config(bytes: &[u8]) -> Option<NetSyncConfig> {
    if bytes.len() != NETSYNC_CONFIG_LEN {
        return None;
    }
    let guard = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    if guard != CONFIG_GUARD {
        return None;
    }
    let maxwait_mins = u16::from_le_bytes([bytes[1], bytes[2]]);
    if !MAXWAIT_RANGE.contains(&maxwait_mins) {
        return None;
    }
    Some(NetSyncConfig {
        enabled: bytes[0] != 0,
        maxwait_mins,
    })
}
