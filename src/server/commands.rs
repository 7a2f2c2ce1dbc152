//! Console / CLI-data command dispatch.
//!
//! Commands arrive from two places: the local serial console
//! (`sender_timestamp == 0`) and authenticated admins over CLI-data text
//! frames. Only commands that mutate or inspect core state live here;
//! there is no radio-parameter surface in this node.

use log::info;

use super::node::{ServerNode, PACKET_LOG_FILE};
use super::{PostSeverity, MAX_POST_TEXT_LEN, MIN_VALID_TIMESTAMP};
use crate::logutil::hex_full;
use crate::mesh::crypto::CryptoProvider;
use crate::mesh::MeshTransport;

impl<T: MeshTransport, C: CryptoProvider> ServerNode<T, C> {
    /// Execute one command line and return the reply text (empty when the
    /// command only prints via its side effects).
    pub fn handle_command(&mut self, sender_timestamp: u32, command: &str) -> String {
        let mut command = command.trim_start();

        // optional three-char companion prefix ("xx|"), reflected back
        let mut prefix = "";
        if command.len() > 4 && command.as_bytes()[2] == b'|' {
            prefix = &command[..3];
            command = &command[3..];
        }
        let body = self.dispatch_command(sender_timestamp, command.trim_end());
        if prefix.is_empty() {
            body
        } else {
            format!("{prefix}{body}")
        }
    }

    fn dispatch_command(&mut self, sender_timestamp: u32, command: &str) -> String {
        let is_serial = sender_timestamp == 0;

        if let Some(args) = command.strip_prefix("setperm ") {
            return self.cmd_setperm(args);
        }
        if command == "get acl" {
            return self.cmd_get_acl();
        }
        if let Some(rest) = command.strip_prefix("bulletin.") {
            return self.cmd_bulletin(rest, is_serial);
        }
        if let Some(text) = command.strip_prefix("addbulletin ") {
            return self.cmd_bulletin(&format!("info {text}"), is_serial);
        }
        if let Some(val) = command.strip_prefix("set nettime.enable ") {
            return match val {
                "on" => {
                    self.netsync.set_enabled(true);
                    self.save_netsync_config();
                    "OK - Network time sync enabled".into()
                }
                "off" => {
                    self.netsync.set_enabled(false);
                    self.save_netsync_config();
                    "OK - Network time sync disabled".into()
                }
                _ => "Error: Use 'on' or 'off'".into(),
            };
        }
        if command == "get nettime.enable" {
            return if self.netsync.enabled() { "on" } else { "off" }.into();
        }
        if let Some(val) = command.strip_prefix("set nettime.maxwait ") {
            return match val.parse::<u16>() {
                Ok(mins) => {
                    if self.netsync.set_maxwait_mins(mins) {
                        self.save_netsync_config();
                        format!("OK - Max wait set to {mins} minutes")
                    } else {
                        "Error: Range 5-60 minutes".into()
                    }
                }
                Err(_) => "Error: Range 5-60 minutes".into(),
            };
        }
        if command == "get nettime.maxwait" {
            return self.netsync.maxwait_mins().to_string();
        }
        if command == "get nettime.status" {
            return self.cmd_nettime_status();
        }
        if command == "get channel.mode" {
            return if self.channel.is_private() {
                "private"
            } else {
                "public"
            }
            .into();
        }
        if let Some(val) = command.strip_prefix("set channel.mode ") {
            return self.cmd_set_channel_mode(val);
        }
        if command == "get channel.key" {
            return self.channel.key_hex(&self.identity.id);
        }
        if command == "login.history" {
            return self.cmd_login_history();
        }
        if let Some(val) = command.strip_prefix("time ") {
            return self.cmd_set_time(val);
        }
        if command == "clock" {
            return if self.clock.is_desynced() {
                format!("{} (desynced)", self.clock.now())
            } else {
                self.clock.now().to_string()
            };
        }
        if command == "log start" {
            self.packet_logging = true;
            return "OK".into();
        }
        if command == "log stop" {
            self.packet_logging = false;
            return "OK".into();
        }
        if command == "erase.logs" {
            return match self.store.remove(PACKET_LOG_FILE) {
                Ok(()) => "OK".into(),
                Err(_) => "Err - unable to erase".into(),
            };
        }
        "Err - unknown command".into()
    }

    fn cmd_setperm(&mut self, args: &str) -> String {
        let Some((hex_str, perm_str)) = args.split_once(' ') else {
            return "Err - bad params".into();
        };
        let Ok(prefix) = crate::validation::parse_pubkey_prefix(hex_str) else {
            return "Err - bad pubkey".into();
        };
        let Ok(perm) = perm_str.trim().parse::<u8>() else {
            return "Err - bad params".into();
        };
        if self.acl.apply_permissions(&self.identity.id, &prefix, perm) {
            self.schedule_lazy_contacts_write();
            "OK".into()
        } else {
            "Err - invalid params".into()
        }
    }

    fn cmd_get_acl(&self) -> String {
        let mut out = String::from("ACL:\n");
        for client in self.acl.iter().filter(|c| c.permissions != 0) {
            out.push_str(&format!(
                "{:02X} {}\n",
                client.permissions,
                hex_full(&client.id.pub_key)
            ));
        }
        out
    }

    fn cmd_bulletin(&mut self, rest: &str, is_serial: bool) -> String {
        if self.clock.is_desynced() {
            return "ERROR: Clock not synced".into();
        }
        let (severity, text) = if let Some(t) = rest.strip_prefix("info ") {
            (PostSeverity::Info, t)
        } else if let Some(t) = rest.strip_prefix("warning ") {
            (PostSeverity::Warning, t)
        } else if let Some(t) = rest.strip_prefix("critical ") {
            (PostSeverity::Critical, t)
        } else {
            return "ERROR: Invalid severity. Use bulletin.info|bulletin.warning|bulletin.critical"
                .into();
        };

        match crate::validation::validate_post_text(text) {
            Err(crate::validation::ValidationError::Empty) => {
                return "ERROR: Empty bulletin".into()
            }
            Err(_) => return format!("ERROR: Max {MAX_POST_TEXT_LEN} chars"),
            Ok(()) => {}
        }
        if let Err(wait_secs) = self.check_bulletin_rate_limit() {
            return format!("ERROR: Rate limit hit. Wait {wait_secs} seconds.");
        }

        self.add_bulletin(text, severity);
        self.last_bulletin_millis = self.clock.millis();

        if is_serial {
            String::new()
        } else {
            format!("OK - {} bulletin posted", severity.name().to_uppercase())
        }
    }

    fn cmd_nettime_status(&self) -> String {
        if self.netsync.synced_once() || !self.clock.is_desynced() {
            "Clock already synced".into()
        } else if !self.netsync.enabled() {
            "Network time sync disabled".into()
        } else {
            format!("Waiting for repeaters ({}/3)", self.netsync.repeater_count())
        }
    }

    fn cmd_set_channel_mode(&mut self, val: &str) -> String {
        match val {
            "public" => {
                if self.channel.set_public(&self.identity.id, &self.crypto) {
                    self.persist_channel_change("Channel mode changed to public");
                }
                "OK - Channel mode set to public".into()
            }
            "private" => {
                if self.channel.set_private(&self.identity.id, &self.crypto) {
                    self.persist_channel_change("Channel mode changed to private");
                    info!(
                        "channel secret: {}",
                        self.channel.key_hex(&self.identity.id)
                    );
                }
                "OK - Channel mode set to private".into()
            }
            _ => "Error: Use 'public' or 'private'".into(),
        }
    }

    fn persist_channel_change(&mut self, notice: &str) {
        if let Err(e) = self.channel.save(&self.store) {
            log::warn!("channel config not persisted: {e:#}");
        }
        self.store.backup(super::channel::CHANNEL_CONFIG_FILE);
        self.add_system_message(notice);
    }

    fn save_netsync_config(&mut self) {
        if let Err(e) = self.netsync.save_config(&self.store) {
            log::warn!("network time sync config not persisted: {e:#}");
        }
        self.store.backup(super::netsync::NETSYNC_CONFIG_FILE);
    }

    fn cmd_login_history(&self) -> String {
        if self.login_history.is_empty() {
            return "No login history available".into();
        }
        let mut out = format!("Last {} logins:\n", self.login_history.len());
        for entry in self.login_history.iter() {
            let role = match entry.permissions {
                super::PERM_ROLE_ADMIN => "admin",
                super::PERM_ROLE_READ_WRITE => "user",
                _ => "guest",
            };
            let when = chrono::DateTime::from_timestamp(entry.timestamp as i64, 0)
                .map(|dt| dt.format("%d/%m/%Y %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| entry.timestamp.to_string());
            out.push_str(&format!("[{}] {} - {}\n", hex_full(&entry.prefix), role, when));
        }
        out
    }

    fn cmd_set_time(&mut self, val: &str) -> String {
        let Ok(timestamp) = val.trim().parse::<u32>() else {
            return "Err - bad params".into();
        };
        if timestamp < MIN_VALID_TIMESTAMP {
            return "Err - timestamp too old".into();
        }
        let was_desynced = self.clock.is_desynced();
        self.clock.set(timestamp);
        if was_desynced && !self.netsync.synced_once() {
            self.netsync.mark_synced_manually();
            self.notify_clock_synced(None);
        } else {
            self.netsync.mark_synced_manually();
        }
        "OK".into()
    }
}
