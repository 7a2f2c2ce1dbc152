//! Mesh transport abstraction: identities, packet types, and the
//! [`MeshTransport`] seam the server core emits through.
//!
//! The radio PHY, air-time accounting and retransmit timing all live behind
//! [`MeshTransport`]; the core only decides *what* to send and whether it
//! goes flood or direct. Packet creation is fallible (`Option`) so a
//! transport with an exhausted outbound pool can refuse an allocation and
//! the caller retries on a later tick.

pub mod crypto;
pub mod udp;
pub mod wire;

use std::fmt;

/// Size of a public key / shared secret in bytes.
pub const PUB_KEY_SIZE: usize = 32;

/// Maximum length of a learned return path (one hash byte per hop).
pub const MAX_PATH_LEN: usize = 64;

/// Maximum payload bytes a single mesh packet can carry.
pub const MAX_PACKET_PAYLOAD: usize = 184;

/// Byte length of a broadcast channel secret.
pub const CHANNEL_KEY_LEN: usize = 16;

/// A peer identity: public key only.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Identity {
    pub pub_key: [u8; PUB_KEY_SIZE],
}

impl Identity {
    pub fn new(pub_key: [u8; PUB_KEY_SIZE]) -> Self {
        Self { pub_key }
    }

    /// True when both identities carry the same public key.
    pub fn matches(&self, other: &Identity) -> bool {
        self.pub_key == other.pub_key
    }

    /// Hash-slot test: the transport addresses peers by the first byte of
    /// their public key, so two identities "match a hash" iff that byte
    /// collides.
    pub fn matches_hash(&self, hash: u8) -> bool {
        self.pub_key[0] == hash
    }

    /// First four bytes of the public key, used in operator-facing text.
    pub fn prefix4(&self) -> [u8; 4] {
        [
            self.pub_key[0],
            self.pub_key[1],
            self.pub_key[2],
            self.pub_key[3],
        ]
    }

    /// First six bytes, used in delivery-tracking sets.
    pub fn prefix6(&self) -> [u8; 6] {
        let mut p = [0u8; 6];
        p.copy_from_slice(&self.pub_key[..6]);
        p
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity[{}]", crate::logutil::hex_prefix(&self.pub_key))
    }
}

/// This node's long-term identity: public key plus secret half.
#[derive(Clone)]
pub struct LocalIdentity {
    pub id: Identity,
    pub secret: [u8; PUB_KEY_SIZE],
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the secret half
        write!(f, "LocalIdentity[{}]", crate::logutil::hex_prefix(&self.id.pub_key))
    }
}

/// Payload type discriminants carried in the packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Req = 0x00,
    Response = 0x01,
    TxtMsg = 0x02,
    Ack = 0x03,
    Advert = 0x04,
    GrpTxt = 0x05,
    AnonReq = 0x07,
    Path = 0x08,
}

/// Advertisement flavour, parsed out of a peer's self-announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AdvertType {
    Chat = 1,
    Repeater = 2,
    Room = 3,
}

/// How an inbound packet reached us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundRoute {
    /// Re-broadcast flood; carries the accumulated path so we can answer
    /// with a path-return.
    Flood { path: Vec<u8> },
    /// Arrived over a previously-learned direct path.
    Direct,
}

impl InboundRoute {
    pub fn is_flood(&self) -> bool {
        matches!(self, InboundRoute::Flood { .. })
    }
}

/// A decoded inbound frame, as handed to the server core by the transport.
///
/// Decryption and peer resolution happen below this seam: `PeerData` frames
/// carry the already-authenticated sender identity.
#[derive(Debug)]
pub enum InboundFrame {
    /// Anonymous request from a possibly-unknown peer (login handshake).
    AnonReq {
        route: InboundRoute,
        sender: Identity,
        payload: Vec<u8>,
    },
    /// Authenticated data from a known peer.
    PeerData {
        route: InboundRoute,
        ptype: PayloadType,
        sender: Identity,
        payload: Vec<u8>,
    },
    /// A return path learned for a peer, optionally bundling an ACK.
    PathUpdate {
        sender: Identity,
        path: Vec<u8>,
        extra_ack: Option<u32>,
    },
    /// Bare acknowledgement token.
    Ack { token: u32 },
    /// A peer self-announcement carrying its clock.
    Advert {
        sender: Identity,
        timestamp: u32,
        kind: AdvertType,
    },
}

/// A broadcast group channel: one-byte hash plus symmetric secret.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupChannel {
    pub hash: u8,
    pub secret: [u8; CHANNEL_KEY_LEN],
}

/// An outbound packet built by the transport, ready to send.
#[derive(Clone, Debug)]
pub struct Packet {
    pub ptype: PayloadType,
    pub dest: Option<Identity>,
    pub payload: Vec<u8>,
}

/// Link-level statistics the transport can report for the status reply.
/// A transport without radio hardware reports zeros.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkStats {
    pub batt_milli_volts: u16,
    pub tx_queue_len: u16,
    pub noise_floor: i16,
    pub last_rssi: i16,
    pub last_snr_x4: i16,
    pub air_time_secs: u32,
    pub direct_dups: u16,
    pub flood_dups: u16,
}

/// The transport capability the server core emits through.
///
/// `create_*` may return `None` when the outbound pool is exhausted; the
/// caller must treat that as "abandon this send and retry later".
pub trait MeshTransport {
    /// Build an encrypted datagram for a known peer.
    fn create_datagram(
        &mut self,
        ptype: PayloadType,
        dest: &Identity,
        secret: &[u8; PUB_KEY_SIZE],
        payload: &[u8],
    ) -> Option<Packet>;

    /// Build a bare ACK packet for `token`.
    fn create_ack(&mut self, token: u32) -> Option<Packet>;

    /// Build a redundant ACK (transmitted ahead of the real one on lossy
    /// direct paths).
    fn create_multi_ack(&mut self, token: u32, repeat: u8) -> Option<Packet>;

    /// Build a path-return packet: teaches the peer the route to us and
    /// piggybacks `payload` as an embedded response.
    fn create_path_return(
        &mut self,
        dest: &Identity,
        secret: &[u8; PUB_KEY_SIZE],
        inbound_path: &[u8],
        ptype: PayloadType,
        payload: &[u8],
    ) -> Option<Packet>;

    /// Build a group-channel broadcast datagram.
    fn create_group_datagram(&mut self, channel: &GroupChannel, payload: &[u8]) -> Option<Packet>;

    /// Queue a packet for flood routing after `delay_ms`.
    fn send_flood(&mut self, pkt: Packet, delay_ms: u32);

    /// Queue a packet for direct routing along `path` after `delay_ms`.
    fn send_direct(&mut self, pkt: Packet, path: &[u8], delay_ms: u32);

    /// Number of packets currently queued for transmission.
    fn outbound_queue_len(&self) -> usize;

    /// Radio-level statistics, zeros when not applicable.
    fn link_stats(&self) -> LinkStats {
        LinkStats::default()
    }
}
