//! Session engine: packet handlers for anonymous login, peer text and
//! command frames, requests, path learning and acknowledgements.
//!
//! Handlers are total: every failure path logs and returns, nothing
//! propagates. Replay defense hangs off each client's `last_timestamp`
//! high-water mark - anonymous requests and text frames at-or-below it are
//! dropped (text at exactly the mark is treated as a retry and re-ACKed
//! without re-executing side effects).

use log::{debug, info};

use super::{
    PERM_ROLE_ADMIN, PERM_ROLE_GUEST, PERM_ROLE_MASK, PERM_ROLE_READ_WRITE,
    MAX_POST_TEXT_LEN, REPLY_DELAY_MILLIS, PUSH_NOTIFY_DELAY_MILLIS, SERVER_RESPONSE_DELAY,
    TXT_ACK_DELAY,
};
use crate::logutil::{escape_log, hex_prefix};
use crate::mesh::crypto::CryptoProvider;
use crate::mesh::wire::{
    self, AnonLoginReq, TextFrame, REQ_TYPE_GET_ACCESS_LIST, REQ_TYPE_GET_STATUS,
    REQ_TYPE_GET_TELEMETRY, REQ_TYPE_KEEP_ALIVE, TXT_TYPE_CLI_DATA, TXT_TYPE_PLAIN,
};
use crate::mesh::{
    Identity, InboundFrame, InboundRoute, MeshTransport, PayloadType, MAX_PACKET_PAYLOAD,
};
use crate::metrics;
use crate::server::node::ServerNode;

/// Shape of an outbound text reply to a peer frame.
enum TxtReply {
    None,
    /// Server-signed plain text (carries our pubkey prefix).
    Signed(String),
    /// CLI data back to an admin console.
    Cli(String),
}

impl<T: MeshTransport, C: CryptoProvider> ServerNode<T, C> {
    /// Dispatch one decoded inbound frame.
    pub fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::AnonReq {
                route,
                sender,
                payload,
            } => {
                self.count_recv(&route);
                self.packet_log(&format!(
                    "RX ANON_REQ from [{}] len={}",
                    hex_prefix(&sender.pub_key),
                    payload.len()
                ));
                self.handle_anon_req(route, sender, &payload);
            }
            InboundFrame::PeerData {
                route,
                ptype,
                sender,
                payload,
            } => {
                self.count_recv(&route);
                self.packet_log(&format!(
                    "RX {:?} from [{}] len={}",
                    ptype,
                    hex_prefix(&sender.pub_key),
                    payload.len()
                ));
                match ptype {
                    PayloadType::TxtMsg if payload.len() > 5 => {
                        self.handle_txt_msg(route, sender, &payload)
                    }
                    PayloadType::Req if payload.len() >= 5 => {
                        self.handle_request_frame(route, sender, &payload)
                    }
                    _ => debug!("ignoring peer frame type {ptype:?} len {}", payload.len()),
                }
            }
            InboundFrame::PathUpdate {
                sender,
                path,
                extra_ack,
            } => {
                metrics::inc_recv_direct();
                self.handle_path(sender, path, extra_ack);
            }
            InboundFrame::Ack { token } => {
                metrics::inc_recv_flood();
                self.process_ack(token);
            }
            InboundFrame::Advert {
                sender,
                timestamp,
                kind,
            } => {
                metrics::inc_recv_flood();
                if kind == crate::mesh::AdvertType::Repeater {
                    self.netsync
                        .on_repeater_advert(&sender, timestamp, &self.clock);
                }
            }
        }
    }

    fn count_recv(&self, route: &InboundRoute) {
        if route.is_flood() {
            metrics::inc_recv_flood();
        } else {
            metrics::inc_recv_direct();
        }
    }

    /// Anonymous login request: password check, optional admin clock sync,
    /// ACL upsert, replay gate, 13-byte response.
    fn handle_anon_req(&mut self, route: InboundRoute, sender: Identity, payload: &[u8]) {
        let Some(req) = AnonLoginReq::parse(payload) else {
            debug!("malformed anon request, dropped");
            return;
        };

        let mut perm: u8 = 0;
        let mut resolved = false;
        if req.password.is_empty() && !self.config.auth.allow_read_only {
            // blank password: only already-known senders may reconnect
            match self.acl.get_by_pubkey(&sender.pub_key) {
                Some(client) => {
                    perm = client.permissions;
                    resolved = true;
                }
                None => {
                    debug!("login: sender [{}] not in ACL", hex_prefix(&sender.pub_key));
                    return;
                }
            }
        }
        if !resolved {
            if req.password == self.config.auth.admin_password.as_bytes() {
                perm = PERM_ROLE_ADMIN;
            } else if req.password == self.config.auth.guest_password.as_bytes() {
                perm = PERM_ROLE_READ_WRITE;
            } else if self.config.auth.allow_read_only {
                perm = PERM_ROLE_GUEST;
            } else {
                debug!("incorrect room password from [{}]", hex_prefix(&sender.pub_key));
                return; // no response; client will time out
            }
        }

        if (perm & PERM_ROLE_MASK) == PERM_ROLE_ADMIN
            && self
                .netsync
                .admin_source_sync(&mut self.clock, req.sender_timestamp)
        {
            info!(
                "clock synced from admin login [{}]: {}",
                hex_prefix(&sender.pub_key),
                req.sender_timestamp
            );
            self.notify_clock_synced(Some(sender.prefix4()));
        }

        let shared_secret = self.crypto.shared_secret(&self.identity, &sender);
        let ci = self.acl.put(sender, 0);
        {
            let client = self.acl.get_mut(ci).unwrap();
            if req.sender_timestamp <= client.last_timestamp {
                debug!("possible replay attack on login from [{}]", hex_prefix(&sender.pub_key));
                return;
            }
            client.last_timestamp = req.sender_timestamp;
            client.room.sync_since = req.sync_since;
            client.room.pending_ack = 0;
            client.room.push_failures = 0;
            client.shared_secret = shared_secret;
        }
        let now = self.clock.now();
        let (permissions, is_admin) = {
            let client = self.acl.get_mut(ci).unwrap();
            client.last_activity = now;
            client.permissions |= perm;
            (client.permissions, client.is_admin())
        };

        info!(
            "user login: [{}] ({})",
            hex_prefix(&sender.pub_key),
            if is_admin { "admin" } else { "user" }
        );
        self.login_history.record(sender.prefix4(), now, perm);

        if is_admin {
            // active again: normal delivery tracking applies from here on
            self.scheduler.reset_prelogin_attempts(ci);
        }

        self.schedule_lazy_contacts_write();

        let role_hint = if is_admin {
            1
        } else if permissions == 0 {
            2
        } else {
            0
        };
        let mut rand_blob = [0u8; 4];
        self.crypto.random_bytes(&mut rand_blob);
        let response = wire::build_login_response(
            self.clock.now_unique(),
            role_hint,
            permissions,
            u32::from_le_bytes(rand_blob),
        );

        // give the response packet time to arrive before the next push
        self.scheduler
            .delay_push(self.clock.millis(), PUSH_NOTIFY_DELAY_MILLIS);

        match route {
            InboundRoute::Flood { path } => {
                // teach the sender the path to here and embed the response
                if let Some(pkt) = self.transport.create_path_return(
                    &sender,
                    &shared_secret,
                    &path,
                    PayloadType::Response,
                    &response,
                ) {
                    self.transport.send_flood(pkt, SERVER_RESPONSE_DELAY);
                }
            }
            InboundRoute::Direct => {
                if let Some(pkt) = self.transport.create_datagram(
                    PayloadType::Response,
                    &sender,
                    &shared_secret,
                    &response,
                ) {
                    let out_path = self.acl.get(ci).and_then(|c| c.out_path.clone());
                    match out_path {
                        Some(path) => self.transport.send_direct(pkt, &path, SERVER_RESPONSE_DELAY),
                        None => self.transport.send_flood(pkt, SERVER_RESPONSE_DELAY),
                    }
                }
            }
        }
    }

    /// Peer text frame: a new post or a CLI command. ACK and reply routing
    /// follow the cached return path, not the inbound route.
    fn handle_txt_msg(&mut self, _route: InboundRoute, sender: Identity, payload: &[u8]) {
        let Some(ci) = self.acl.index_by_pubkey(&sender.pub_key) else {
            debug!("text from unknown peer [{}], dropped", hex_prefix(&sender.pub_key));
            return;
        };
        let Some(frame) = TextFrame::parse(payload) else {
            return;
        };

        if self.acl.get(ci).unwrap().is_admin()
            && self
                .netsync
                .admin_source_sync(&mut self.clock, frame.sender_timestamp)
        {
            info!(
                "clock synced from admin [{}]: {}",
                hex_prefix(&sender.pub_key),
                frame.sender_timestamp
            );
            self.notify_clock_synced(Some(sender.prefix4()));
        }

        if frame.txt_type != TXT_TYPE_PLAIN && frame.txt_type != TXT_TYPE_CLI_DATA {
            debug!("unsupported text type {:#04x}, dropped", frame.txt_type);
            return;
        }
        if frame.sender_timestamp < self.acl.get(ci).unwrap().last_timestamp {
            debug!("possible replay attack from [{}]", hex_prefix(&sender.pub_key));
            return;
        }
        let is_retry = frame.sender_timestamp == self.acl.get(ci).unwrap().last_timestamp;

        let now = self.clock.now_unique();
        {
            let client = self.acl.get_mut(ci).unwrap();
            client.last_timestamp = frame.sender_timestamp;
            client.last_activity = now;
            client.room.push_failures = 0; // heard from again: push may resume
        }

        let ack_token = self
            .crypto
            .ack_token(&payload[..frame.acked_len()], &sender);

        let text = String::from_utf8_lossy(frame.text).into_owned();
        let mut send_ack = false;
        let mut reply = TxtReply::None;

        if frame.txt_type == TXT_TYPE_CLI_DATA {
            if self.acl.get(ci).unwrap().is_admin() {
                if !is_retry {
                    let out = self.handle_command(frame.sender_timestamp, &text);
                    reply = TxtReply::Cli(out);
                }
            } else {
                debug!("CLI data from non-admin [{}], ignored", hex_prefix(&sender.pub_key));
            }
        } else {
            // plain text: a new post
            if self.acl.get(ci).unwrap().is_guest() {
                debug!("post from guest [{}], ignored", hex_prefix(&sender.pub_key));
            } else if self.clock.is_desynced() {
                reply = TxtReply::Signed("Error: Server clock desynced".to_string());
            } else {
                if !is_retry {
                    if text.len() <= MAX_POST_TEXT_LEN {
                        self.add_post(sender, &text);
                    } else {
                        debug!(
                            "over-length post from [{}] rejected ({} bytes)",
                            hex_prefix(&sender.pub_key),
                            text.len()
                        );
                    }
                } else {
                    debug!("retry of post from [{}]: {}", hex_prefix(&sender.pub_key), escape_log(&text));
                }
                send_ack = true;
            }
        }

        let out_path = self.acl.get(ci).unwrap().out_path.clone();
        let mut delay_millis: u32 = 0;
        if send_ack {
            match &out_path {
                None => {
                    if let Some(ack) = self.transport.create_ack(ack_token) {
                        self.transport.send_flood(ack, TXT_ACK_DELAY);
                    }
                    delay_millis = TXT_ACK_DELAY + REPLY_DELAY_MILLIS;
                }
                Some(path) => {
                    let mut d = TXT_ACK_DELAY;
                    if self.config.node.multi_acks > 0 {
                        if let Some(a1) = self.transport.create_multi_ack(ack_token, 1) {
                            self.transport.send_direct(a1, path, d);
                        }
                        d += 300;
                    }
                    if let Some(a2) = self.transport.create_ack(ack_token) {
                        self.transport.send_direct(a2, path, d);
                    }
                    delay_millis = d + REPLY_DELAY_MILLIS;
                }
            }
        }

        let reply_payload = match &reply {
            TxtReply::None => None,
            TxtReply::Signed(text) if text.is_empty() => None,
            TxtReply::Cli(text) if text.is_empty() => None,
            TxtReply::Signed(text) => {
                // keep the client's view of our clock strictly ahead of its
                // own echoed timestamp
                let mut reply_now = now;
                if reply_now == frame.sender_timestamp {
                    reply_now += 1;
                }
                Some(wire::build_signed_reply(
                    reply_now,
                    &self.identity.id,
                    text.as_bytes(),
                ))
            }
            TxtReply::Cli(text) => {
                let mut reply_now = now;
                if reply_now == frame.sender_timestamp {
                    reply_now += 1;
                }
                Some(wire::build_cli_reply(reply_now, text.as_bytes()))
            }
        };

        if let Some(reply_payload) = reply_payload {
            let secret = self.acl.get(ci).unwrap().shared_secret;
            if let Some(pkt) = self.transport.create_datagram(
                PayloadType::TxtMsg,
                &sender,
                &secret,
                &reply_payload,
            ) {
                let delay = delay_millis + SERVER_RESPONSE_DELAY;
                match &out_path {
                    Some(path) => self.transport.send_direct(pkt, path, delay),
                    None => self.transport.send_flood(pkt, delay),
                }
            }
        }
    }

    /// Peer request frame: status, keep-alive, telemetry, access list.
    fn handle_request_frame(&mut self, route: InboundRoute, sender: Identity, payload: &[u8]) {
        let Some(ci) = self.acl.index_by_pubkey(&sender.pub_key) else {
            debug!("request from unknown peer [{}], dropped", hex_prefix(&sender.pub_key));
            return;
        };
        let sender_timestamp =
            u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if sender_timestamp < self.acl.get(ci).unwrap().last_timestamp {
            debug!("possible replay attack from [{}]", hex_prefix(&sender.pub_key));
            return;
        }

        let now = self.clock.now();
        {
            let client = self.acl.get_mut(ci).unwrap();
            client.last_timestamp = sender_timestamp;
            client.last_activity = now; // keeps the connection alive
            client.room.push_failures = 0;
        }

        if payload[4] == REQ_TYPE_KEEP_ALIVE && !route.is_flood() {
            self.handle_keep_alive(ci, sender, payload);
            return;
        }

        let reply = self.handle_request(ci, sender_timestamp, &payload[4..]);
        if reply.is_empty() {
            return;
        }
        let secret = self.acl.get(ci).unwrap().shared_secret;
        match route {
            InboundRoute::Flood { path } => {
                if let Some(pkt) = self.transport.create_path_return(
                    &sender,
                    &secret,
                    &path,
                    PayloadType::Response,
                    &reply,
                ) {
                    self.transport.send_flood(pkt, SERVER_RESPONSE_DELAY);
                }
            }
            InboundRoute::Direct => {
                if let Some(pkt) = self.transport.create_datagram(
                    PayloadType::Response,
                    &sender,
                    &secret,
                    &reply,
                ) {
                    let out_path = self.acl.get(ci).and_then(|c| c.out_path.clone());
                    match out_path {
                        Some(path) => self.transport.send_direct(pkt, &path, SERVER_RESPONSE_DELAY),
                        None => self.transport.send_flood(pkt, SERVER_RESPONSE_DELAY),
                    }
                }
            }
        }
    }

    /// Keep-alive: optionally jam `sync_since` forward, clear any pending
    /// push, and answer direct-only with an ACK annotated with the
    /// client's unsynced count.
    fn handle_keep_alive(&mut self, ci: usize, sender: Identity, payload: &[u8]) {
        let mut force_since = 0u32;
        let mut acked = [0u8; 9];
        let n = payload.len().min(9);
        acked[..n].copy_from_slice(&payload[..n]);
        if payload.len() >= 9 {
            force_since = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
        }
        {
            let client = self.acl.get_mut(ci).unwrap();
            if force_since > 0 {
                client.room.sync_since = force_since;
            }
            client.room.pending_ack = 0;
        }

        // keep-alive responses only ever go direct
        let Some(path) = self.acl.get(ci).unwrap().out_path.clone() else {
            return;
        };
        let token = self.crypto.ack_token(&acked, &sender);
        if let Some(mut ack) = self.transport.create_ack(token) {
            let unsynced = self.posts.count_unsynced_for(self.acl.get(ci).unwrap());
            ack.payload.push(unsynced);
            self.transport.send_direct(ack, &path, SERVER_RESPONSE_DELAY);
        }
    }

    /// Build a request reply body (sender timestamp reflected back as a
    /// tag, then the per-request payload). Empty means unknown request.
    fn handle_request(&mut self, ci: usize, sender_timestamp: u32, req: &[u8]) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend_from_slice(&sender_timestamp.to_le_bytes());
        match req[0] {
            REQ_TYPE_GET_STATUS => {
                reply.extend_from_slice(&self.status_snapshot().encode());
                reply
            }
            REQ_TYPE_GET_TELEMETRY => {
                // first reserved byte is an inverse mask over the sender's
                // effective permissions; it gates everything beyond the
                // always-public voltage record
                let perm_mask = !req.get(1).copied().unwrap_or(0);
                let is_admin = self.acl.get(ci).unwrap().is_admin();
                let sensor_mask = (if is_admin { 0xFFu8 } else { 0x00 }) & perm_mask;
                let position = (sensor_mask != 0
                    && (self.config.node.lat != 0.0 || self.config.node.lon != 0.0))
                    .then_some((self.config.node.lat, self.config.node.lon));
                let batt = self.transport.link_stats().batt_milli_volts;
                reply.extend_from_slice(&wire::build_telemetry(batt, position));
                reply
            }
            REQ_TYPE_GET_ACCESS_LIST if self.acl.get(ci).unwrap().is_admin() => {
                let res1 = req.get(1).copied().unwrap_or(0);
                let res2 = req.get(2).copied().unwrap_or(0);
                if res1 != 0 || res2 != 0 {
                    return Vec::new(); // reserved for future query params
                }
                let body = wire::build_access_list(
                    self.acl
                        .iter()
                        .filter(|c| c.is_admin())
                        .map(|c| (&c.id, c.permissions)),
                    MAX_PACKET_PAYLOAD - 8,
                );
                reply.extend_from_slice(&body);
                reply
            }
            other => {
                debug!("unknown request type {other:#04x}");
                Vec::new()
            }
        }
    }

    /// Path learning: cache the observed return route and process any
    /// bundled ACK. No reciprocal path is sent.
    fn handle_path(&mut self, sender: Identity, path: Vec<u8>, extra_ack: Option<u32>) {
        match self.acl.index_by_pubkey(&sender.pub_key) {
            Some(ci) => {
                debug!(
                    "path to client [{}], len={}",
                    hex_prefix(&sender.pub_key),
                    path.len()
                );
                let now = self.clock.now();
                let client = self.acl.get_mut(ci).unwrap();
                client.out_path = Some(path);
                client.last_activity = now;
            }
            None => {
                debug!("path from unknown peer [{}], ignored", hex_prefix(&sender.pub_key));
            }
        }
        if let Some(token) = extra_ack {
            self.process_ack(token);
        }
    }
}
