//! Test utilities & fixtures: a recording mock transport, a node factory
//! over a temp data dir, and inbound frame builders.

#![allow(dead_code)] // each integration test uses a subset of these helpers

use bytes::BufMut;
use tempfile::TempDir;

use meshboard::config::Config;
use meshboard::mesh::crypto::StdCrypto;
use meshboard::mesh::{
    GroupChannel, Identity, InboundFrame, InboundRoute, LinkStats, MeshTransport, Packet,
    PayloadType, PUB_KEY_SIZE,
};
use meshboard::server::{ClockService, ManualTime, ServerNode};
use meshboard::storage::BlobStore;

/// How a recorded packet was routed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendMode {
    Flood,
    Direct(Vec<u8>),
}

/// One packet captured by the mock transport.
#[derive(Clone, Debug)]
pub struct SentPacket {
    pub ptype: PayloadType,
    pub dest: Option<Identity>,
    pub payload: Vec<u8>,
    pub mode: SendMode,
    pub delay_ms: u32,
}

impl SentPacket {
    /// ACK token carried by an Ack packet.
    pub fn ack_token(&self) -> u32 {
        assert_eq!(self.ptype, PayloadType::Ack);
        u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ])
    }
}

/// Transport double that records everything and can simulate pool
/// exhaustion.
#[derive(Default)]
pub struct MockTransport {
    pub sent: Vec<SentPacket>,
    pub refuse_alloc: bool,
    staged: Vec<Packet>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, pkt: Packet, mode: SendMode, delay_ms: u32) {
        self.sent.push(SentPacket {
            ptype: pkt.ptype,
            dest: pkt.dest,
            payload: pkt.payload,
            mode,
            delay_ms,
        });
    }

    /// Packets addressed to `dest`.
    pub fn sent_to(&self, dest: &Identity) -> Vec<&SentPacket> {
        self.sent
            .iter()
            .filter(|p| p.dest.as_ref().is_some_and(|d| d.matches(dest)))
            .collect()
    }

    /// Recorded ACK packets (no dest).
    pub fn acks(&self) -> Vec<&SentPacket> {
        self.sent
            .iter()
            .filter(|p| p.ptype == PayloadType::Ack)
            .collect()
    }
}

impl MeshTransport for MockTransport {
    fn create_datagram(
        &mut self,
        ptype: PayloadType,
        dest: &Identity,
        _secret: &[u8; PUB_KEY_SIZE],
        payload: &[u8],
    ) -> Option<Packet> {
        if self.refuse_alloc {
            return None;
        }
        Some(Packet {
            ptype,
            dest: Some(*dest),
            payload: payload.to_vec(),
        })
    }

    fn create_ack(&mut self, token: u32) -> Option<Packet> {
        if self.refuse_alloc {
            return None;
        }
        Some(Packet {
            ptype: PayloadType::Ack,
            dest: None,
            payload: token.to_le_bytes().to_vec(),
        })
    }

    fn create_multi_ack(&mut self, token: u32, _repeat: u8) -> Option<Packet> {
        self.create_ack(token)
    }

    fn create_path_return(
        &mut self,
        dest: &Identity,
        _secret: &[u8; PUB_KEY_SIZE],
        _inbound_path: &[u8],
        ptype: PayloadType,
        payload: &[u8],
    ) -> Option<Packet> {
        if self.refuse_alloc {
            return None;
        }
        // record the embedded response directly for easy assertions
        Some(Packet {
            ptype,
            dest: Some(*dest),
            payload: payload.to_vec(),
        })
    }

    fn create_group_datagram(&mut self, channel: &GroupChannel, payload: &[u8]) -> Option<Packet> {
        if self.refuse_alloc {
            return None;
        }
        let mut body = vec![channel.hash];
        body.extend_from_slice(payload);
        Some(Packet {
            ptype: PayloadType::GrpTxt,
            dest: None,
            payload: body,
        })
    }

    fn send_flood(&mut self, pkt: Packet, delay_ms: u32) {
        self.record(pkt, SendMode::Flood, delay_ms);
    }

    fn send_direct(&mut self, pkt: Packet, path: &[u8], delay_ms: u32) {
        self.record(pkt, SendMode::Direct(path.to_vec()), delay_ms);
    }

    fn outbound_queue_len(&self) -> usize {
        self.staged.len()
    }

    fn link_stats(&self) -> LinkStats {
        LinkStats::default()
    }
}

/// A server node wired to manual time, a mock transport and a temp dir.
pub struct TestNode {
    pub node: ServerNode<MockTransport, StdCrypto>,
    pub time: ManualTime,
    pub dir: TempDir,
}

impl TestNode {
    pub fn transport(&self) -> &MockTransport {
        self.node.transport()
    }

    pub fn clear_sent(&mut self) {
        self.node.transport_mut().sent.clear();
    }

    /// Advance manual time and run one cooperative tick.
    pub fn tick_after(&mut self, step_ms: u64) {
        self.time.advance_ms(step_ms);
        self.node.loop_tick();
    }

    /// Run `n` ticks separated by `step_ms`.
    pub fn run_ticks(&mut self, n: usize, step_ms: u64) {
        for _ in 0..n {
            self.tick_after(step_ms);
        }
    }
}

pub fn new_node() -> TestNode {
    new_node_with(Config::default())
}

pub fn new_node_with(config: Config) -> TestNode {
    let dir = TempDir::new().expect("tempdir");
    let (node, time) = boot_node_in(dir.path(), config);
    TestNode { node, time, dir }
}

/// Construct and `begin()` a node over an existing data dir (reboot
/// support for persistence tests).
pub fn boot_node_in(
    path: &std::path::Path,
    config: Config,
) -> (ServerNode<MockTransport, StdCrypto>, ManualTime) {
    let store = BlobStore::open(path, None).expect("store");
    let time = ManualTime::new();
    let clock = ClockService::new(Box::new(time.clone()));
    let mut node = ServerNode::new(config, store, MockTransport::new(), StdCrypto, clock)
        .expect("node");
    node.begin().expect("begin");
    (node, time)
}

/// Identity with a recognizable leading byte.
pub fn ident(first: u8) -> Identity {
    let mut key = [0u8; PUB_KEY_SIZE];
    key[0] = first;
    key[1] = first;
    key[2] = first;
    key[3] = first;
    key[4] = 0x5A;
    Identity::new(key)
}

pub fn flood() -> InboundRoute {
    InboundRoute::Flood { path: vec![0x11, 0x22] }
}

/// Anonymous login request frame (flood-routed).
pub fn anon_req(sender: Identity, sender_ts: u32, sync_since: u32, password: &str) -> InboundFrame {
    let mut payload = Vec::new();
    payload.put_u32_le(sender_ts);
    payload.put_u32_le(sync_since);
    payload.extend_from_slice(password.as_bytes());
    payload.push(0);
    InboundFrame::AnonReq {
        route: flood(),
        sender,
        payload,
    }
}

/// Plain text frame carrying a new post.
pub fn txt_plain(sender: Identity, sender_ts: u32, text: &str) -> InboundFrame {
    txt_frame(sender, sender_ts, 0, text) // TXT_TYPE_PLAIN
}

/// CLI-data text frame.
pub fn txt_cli(sender: Identity, sender_ts: u32, command: &str) -> InboundFrame {
    txt_frame(sender, sender_ts, 1, command) // TXT_TYPE_CLI_DATA
}

fn txt_frame(sender: Identity, sender_ts: u32, txt_type: u8, text: &str) -> InboundFrame {
    let mut payload = Vec::new();
    payload.put_u32_le(sender_ts);
    payload.put_u8(txt_type << 2);
    payload.extend_from_slice(text.as_bytes());
    InboundFrame::PeerData {
        route: flood(),
        ptype: PayloadType::TxtMsg,
        sender,
        payload,
    }
}

/// Request frame (`GET_STATUS` etc).
pub fn req_frame(sender: Identity, sender_ts: u32, body: &[u8], direct: bool) -> InboundFrame {
    let mut payload = Vec::new();
    payload.put_u32_le(sender_ts);
    payload.extend_from_slice(body);
    InboundFrame::PeerData {
        route: if direct {
            InboundRoute::Direct
        } else {
            flood()
        },
        ptype: PayloadType::Req,
        sender,
        payload,
    }
}

/// Repeater advertisement frame.
pub fn repeater_advert(sender: Identity, timestamp: u32) -> InboundFrame {
    InboundFrame::Advert {
        sender,
        timestamp,
        kind: meshboard::mesh::AdvertType::Repeater,
    }
}

#[test]
fn mock_transport_records_sends() {
    let mut transport = MockTransport::new();
    let ack = transport.create_ack(0xABCD).unwrap();
    transport.send_flood(ack, 200);
    assert_eq!(transport.acks().len(), 1);
    assert_eq!(transport.acks()[0].ack_token(), 0xABCD);
    assert_eq!(transport.acks()[0].mode, SendMode::Flood);
}
