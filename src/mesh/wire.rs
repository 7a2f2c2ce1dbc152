//! Little-endian payload codecs for the over-the-air formats.
//!
//! All multi-byte integers are little-endian and all timestamps are 32-bit
//! UNIX seconds. Telemetry records are the one exception: they follow the
//! CayenneLPP convention of big-endian values.

use bytes::BufMut;

use super::Identity;

/// Text payload types carried in the upper six bits of the flags byte.
pub const TXT_TYPE_PLAIN: u8 = 0;
pub const TXT_TYPE_CLI_DATA: u8 = 1;
pub const TXT_TYPE_SIGNED_PLAIN: u8 = 2;

/// Request subtypes (first payload byte of a `Req` frame).
pub const REQ_TYPE_GET_STATUS: u8 = 0x01;
pub const REQ_TYPE_KEEP_ALIVE: u8 = 0x02;
pub const REQ_TYPE_GET_TELEMETRY: u8 = 0x03;
pub const REQ_TYPE_GET_ACCESS_LIST: u8 = 0x05;

/// Login response status byte.
pub const RESP_SERVER_LOGIN_OK: u8 = 0;

/// Reported protocol feature level.
pub const FIRMWARE_VER_LEVEL: u8 = 1;

/// CayenneLPP voltage record type.
const LPP_TYPE_VOLTAGE: u8 = 0x74;
/// CayenneLPP GPS record type.
const LPP_TYPE_GPS: u8 = 0x88;
/// LPP channel reserved for the node's own sensors.
const LPP_CHANNEL_SELF: u8 = 1;

/// Parsed anonymous login request: `sender_ts:u32 | sync_since:u32 |
/// password:cstring`.
#[derive(Debug, PartialEq, Eq)]
pub struct AnonLoginReq<'a> {
    pub sender_timestamp: u32,
    pub sync_since: u32,
    pub password: &'a [u8],
}

impl<'a> AnonLoginReq<'a> {
    pub fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        let sender_timestamp = read_u32(&payload[0..4]);
        let sync_since = read_u32(&payload[4..8]);
        let rest = &payload[8..];
        let pw_len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Some(Self {
            sender_timestamp,
            sync_since,
            password: &rest[..pw_len],
        })
    }
}

/// Build the fixed 13-byte login response.
///
/// `now:u32 | status:u8 | 0:u8 | role_hint:u8 | permissions:u8 | rand:u32 |
/// fw_level:u8`. `role_hint` is 1 for admin, 2 for a no-permission entry,
/// 0 otherwise.
pub fn build_login_response(now: u32, role_hint: u8, permissions: u8, rand_blob: u32) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[0..4].copy_from_slice(&now.to_le_bytes());
    out[4] = RESP_SERVER_LOGIN_OK;
    out[5] = 0; // legacy keep-alive interval field
    out[6] = role_hint;
    out[7] = permissions;
    out[8..12].copy_from_slice(&rand_blob.to_le_bytes());
    out[12] = FIRMWARE_VER_LEVEL;
    out
}

/// Parsed text/command frame: `sender_ts:u32 | flags:u8 | text…`.
///
/// `text` stops at the first NUL (inbound frames may be padded with zeros
/// past the logical end).
#[derive(Debug)]
pub struct TextFrame<'a> {
    pub sender_timestamp: u32,
    pub txt_type: u8,
    pub attempt: u8,
    pub text: &'a [u8],
}

impl<'a> TextFrame<'a> {
    pub fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.len() <= 5 {
            return None;
        }
        let flags = payload[4];
        let rest = &payload[5..];
        let text_len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Some(Self {
            sender_timestamp: read_u32(&payload[0..4]),
            txt_type: flags >> 2,
            attempt: flags & 0x03,
            text: &rest[..text_len],
        })
    }

    /// The byte span an ACK token is computed over: header plus the logical
    /// text, excluding any zero padding.
    pub fn acked_len(&self) -> usize {
        5 + self.text.len()
    }
}

/// Build a post-push payload:
/// `post_ts:u32 | (SIGNED_PLAIN<<2 | attempt):u8 | author_pub[0..4] | text`.
pub fn build_push_payload(post_timestamp: u32, attempt: u8, author: &Identity, text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + text.len());
    out.put_u32_le(post_timestamp);
    out.put_u8((TXT_TYPE_SIGNED_PLAIN << 2) | (attempt & 0x03));
    out.extend_from_slice(&author.pub_key[..4]);
    out.extend_from_slice(text);
    out
}

/// Build a server-signed text reply (user command replies, error notices):
/// `now:u32 | SIGNED_PLAIN<<2 | server_pub[0..4] | text`.
pub fn build_signed_reply(now: u32, server: &Identity, text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + text.len());
    out.put_u32_le(now);
    out.put_u8(TXT_TYPE_SIGNED_PLAIN << 2);
    out.extend_from_slice(&server.pub_key[..4]);
    out.extend_from_slice(text);
    out
}

/// Build a CLI-data reply: `now:u32 | CLI_DATA<<2 | text`.
pub fn build_cli_reply(now: u32, text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + text.len());
    out.put_u32_le(now);
    out.put_u8(TXT_TYPE_CLI_DATA << 2);
    out.extend_from_slice(text);
    out
}

/// Fixed-layout statistics struct for `GET_STATUS` replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub batt_milli_volts: u16,
    pub curr_tx_queue_len: u16,
    pub noise_floor: i16,
    pub last_rssi: i16,
    pub n_packets_recv: u32,
    pub n_packets_sent: u32,
    pub total_air_time_secs: u32,
    pub total_up_time_secs: u32,
    pub n_sent_flood: u32,
    pub n_sent_direct: u32,
    pub n_recv_flood: u32,
    pub n_recv_direct: u32,
    pub err_events: u16,
    pub last_snr_x4: i16,
    pub n_direct_dups: u16,
    pub n_flood_dups: u16,
    pub n_posted: u16,
    pub n_post_push: u16,
}

impl ServerStatus {
    /// Packed little-endian size.
    pub const ENCODED_LEN: usize = 52;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.put_u16_le(self.batt_milli_volts);
        out.put_u16_le(self.curr_tx_queue_len);
        out.put_i16_le(self.noise_floor);
        out.put_i16_le(self.last_rssi);
        out.put_u32_le(self.n_packets_recv);
        out.put_u32_le(self.n_packets_sent);
        out.put_u32_le(self.total_air_time_secs);
        out.put_u32_le(self.total_up_time_secs);
        out.put_u32_le(self.n_sent_flood);
        out.put_u32_le(self.n_sent_direct);
        out.put_u32_le(self.n_recv_flood);
        out.put_u32_le(self.n_recv_direct);
        out.put_u16_le(self.err_events);
        out.put_i16_le(self.last_snr_x4);
        out.put_u16_le(self.n_direct_dups);
        out.put_u16_le(self.n_flood_dups);
        out.put_u16_le(self.n_posted);
        out.put_u16_le(self.n_post_push);
        out
    }
}

/// Build a `GET_ACCESS_LIST` reply body: packed `(pub_key[0..6], perm)`
/// tuples, admins only. `max_len` bounds the reply to the packet budget.
pub fn build_access_list<'a, I>(admins: I, max_len: usize) -> Vec<u8>
where
    I: Iterator<Item = (&'a Identity, u8)>,
{
    let mut out = Vec::new();
    for (id, perm) in admins {
        if out.len() + 7 > max_len {
            break;
        }
        out.extend_from_slice(&id.pub_key[..6]);
        out.push(perm);
    }
    out
}

/// CayenneLPP telemetry: node supply voltage always, plus a GPS record
/// when the caller's sensor mask admits it and a position is configured.
/// LPP values are big-endian by convention.
pub fn build_telemetry(batt_milli_volts: u16, position: Option<(f64, f64)>) -> Vec<u8> {
    let centivolts = batt_milli_volts / 10;
    let mut out = Vec::with_capacity(15);
    out.push(LPP_CHANNEL_SELF);
    out.push(LPP_TYPE_VOLTAGE);
    out.put_u16(centivolts);
    if let Some((lat, lon)) = position {
        out.push(LPP_CHANNEL_SELF);
        out.push(LPP_TYPE_GPS);
        put_i24(&mut out, (lat * 10_000.0) as i32);
        put_i24(&mut out, (lon * 10_000.0) as i32);
        put_i24(&mut out, 0); // altitude unknown
    }
    out
}

fn put_i24(out: &mut Vec<u8>, value: i32) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[1..4]);
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
