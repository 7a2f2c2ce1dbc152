//! Demo mesh transport over UDP datagrams.
//!
//! Stands in for the radio when running on a workstation: one UDP datagram
//! carries one mesh frame, flood means "send to every known peer", and
//! frames travel in the clear with the full sender key in the header.
//! Useful for bench testing against simulated clients; not a radio.
//!
//! Frame layout: `ptype:u8 | route:u8 | path_len:u8 | path | sender_pub[32]
//! | payload…`.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use anyhow::{Context, Result};
use log::{debug, warn};

use super::{
    AdvertType, GroupChannel, Identity, InboundFrame, InboundRoute, LinkStats, MeshTransport,
    Packet, PayloadType, PUB_KEY_SIZE,
};
use crate::metrics;

const ROUTE_FLOOD: u8 = 0;
const ROUTE_DIRECT: u8 = 1;

/// UDP-datagram mesh transport.
pub struct UdpTransport {
    socket: UdpSocket,
    local_key: [u8; PUB_KEY_SIZE],
    peers: HashSet<SocketAddr>,
}

impl UdpTransport {
    /// Bind the transport socket; `static_peers` are always flooded to in
    /// addition to peers learned from inbound traffic.
    pub fn bind(addr: &str, static_peers: &[String]) -> Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("binding UDP {addr}"))?;
        socket.set_nonblocking(true)?;
        let mut peers = HashSet::new();
        for peer in static_peers {
            match peer.to_socket_addrs() {
                Ok(addrs) => peers.extend(addrs),
                Err(e) => warn!("peer address {peer} not resolvable: {e}"),
            }
        }
        Ok(Self {
            socket,
            local_key: [0u8; PUB_KEY_SIZE],
            peers,
        })
    }

    /// Stamp outbound frames with this node's public key.
    pub fn set_local_key(&mut self, key: [u8; PUB_KEY_SIZE]) {
        self.local_key = key;
    }

    /// Drain all pending datagrams into decoded frames, learning peer
    /// addresses as they appear.
    pub fn poll_inbound(&mut self) -> Vec<InboundFrame> {
        let mut frames = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    self.peers.insert(from);
                    match decode_frame(&buf[..len]) {
                        Some(frame) => frames.push(frame),
                        None => debug!("undecodable {len}-byte datagram from {from}"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("UDP receive error: {e}");
                    break;
                }
            }
        }
        frames
    }

    fn broadcast(&self, frame: &[u8]) {
        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(frame, peer) {
                debug!("send to {peer} failed: {e}");
            }
        }
    }

    fn encode(&self, pkt: &Packet, route: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + PUB_KEY_SIZE + pkt.payload.len());
        out.push(pkt.ptype as u8);
        out.push(route);
        out.push(0); // no path bytes in the demo framing
        out.extend_from_slice(&self.local_key);
        out.extend_from_slice(&pkt.payload);
        out
    }
}

/// Decode one datagram into an inbound frame.
fn decode_frame(bytes: &[u8]) -> Option<InboundFrame> {
    if bytes.len() < 3 {
        return None;
    }
    let ptype = bytes[0];
    let route_byte = bytes[1];
    let path_len = bytes[2] as usize;
    if bytes.len() < 3 + path_len + PUB_KEY_SIZE {
        return None;
    }
    let path = bytes[3..3 + path_len].to_vec();
    let mut key = [0u8; PUB_KEY_SIZE];
    key.copy_from_slice(&bytes[3 + path_len..3 + path_len + PUB_KEY_SIZE]);
    let sender = Identity::new(key);
    let payload = bytes[3 + path_len + PUB_KEY_SIZE..].to_vec();
    let route = if route_byte == ROUTE_DIRECT {
        InboundRoute::Direct
    } else {
        InboundRoute::Flood { path: path.clone() }
    };

    match ptype {
        x if x == PayloadType::AnonReq as u8 => Some(InboundFrame::AnonReq {
            route,
            sender,
            payload,
        }),
        x if x == PayloadType::TxtMsg as u8 => Some(InboundFrame::PeerData {
            route,
            ptype: PayloadType::TxtMsg,
            sender,
            payload,
        }),
        x if x == PayloadType::Req as u8 => Some(InboundFrame::PeerData {
            route,
            ptype: PayloadType::Req,
            sender,
            payload,
        }),
        x if x == PayloadType::Ack as u8 => {
            if payload.len() < 4 {
                return None;
            }
            Some(InboundFrame::Ack {
                token: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            })
        }
        x if x == PayloadType::Advert as u8 => {
            if payload.len() < 5 {
                return None;
            }
            let timestamp =
                u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let kind = match payload[4] {
                1 => AdvertType::Chat,
                2 => AdvertType::Repeater,
                3 => AdvertType::Room,
                _ => return None,
            };
            Some(InboundFrame::Advert {
                sender,
                timestamp,
                kind,
            })
        }
        x if x == PayloadType::Path as u8 => {
            // payload: path_len u8 | path | extra ACK token (optional)
            if payload.is_empty() {
                return None;
            }
            let plen = payload[0] as usize;
            if payload.len() < 1 + plen {
                return None;
            }
            let learned = payload[1..1 + plen].to_vec();
            let rest = &payload[1 + plen..];
            let extra_ack = (rest.len() >= 4)
                .then(|| u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]));
            Some(InboundFrame::PathUpdate {
                sender,
                path: learned,
                extra_ack,
            })
        }
        _ => None,
    }
}

impl MeshTransport for UdpTransport {
    fn create_datagram(
        &mut self,
        ptype: PayloadType,
        dest: &Identity,
        _secret: &[u8; PUB_KEY_SIZE],
        payload: &[u8],
    ) -> Option<Packet> {
        Some(Packet {
            ptype,
            dest: Some(*dest),
            payload: payload.to_vec(),
        })
    }

    fn create_ack(&mut self, token: u32) -> Option<Packet> {
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
        inbound_path: &[u8],
        ptype: PayloadType,
        payload: &[u8],
    ) -> Option<Packet> {
        // reverse path + embedded response, as the peer expects
        let mut body = Vec::with_capacity(1 + inbound_path.len() + 1 + payload.len());
        body.push(inbound_path.len() as u8);
        body.extend_from_slice(inbound_path);
        body.push(ptype as u8);
        body.extend_from_slice(payload);
        Some(Packet {
            ptype: PayloadType::Path,
            dest: Some(*dest),
            payload: body,
        })
    }

    fn create_group_datagram(&mut self, channel: &GroupChannel, payload: &[u8]) -> Option<Packet> {
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(channel.hash);
        body.extend_from_slice(payload);
        Some(Packet {
            ptype: PayloadType::GrpTxt,
            dest: None,
            payload: body,
        })
    }

    fn send_flood(&mut self, pkt: Packet, _delay_ms: u32) {
        metrics::inc_sent_flood();
        let frame = self.encode(&pkt, ROUTE_FLOOD);
        self.broadcast(&frame);
    }

    fn send_direct(&mut self, pkt: Packet, _path: &[u8], _delay_ms: u32) {
        metrics::inc_sent_direct();
        let frame = self.encode(&pkt, ROUTE_DIRECT);
        self.broadcast(&frame);
    }

    fn outbound_queue_len(&self) -> usize {
        0 // datagrams leave immediately
    }

    fn link_stats(&self) -> LinkStats {
        LinkStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_anon_req_frame() {
        let mut frame = vec![PayloadType::AnonReq as u8, ROUTE_FLOOD, 2, 0xA1, 0xA2];
        frame.extend_from_slice(&[7u8; PUB_KEY_SIZE]);
        frame.extend_from_slice(b"payload");
        match decode_frame(&frame) {
            Some(InboundFrame::AnonReq {
                route,
                sender,
                payload,
            }) => {
                assert_eq!(route, InboundRoute::Flood { path: vec![0xA1, 0xA2] });
                assert_eq!(sender.pub_key, [7u8; PUB_KEY_SIZE]);
                assert_eq!(payload, b"payload");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decode_ack_frame() {
        let mut frame = vec![PayloadType::Ack as u8, ROUTE_FLOOD, 0];
        frame.extend_from_slice(&[1u8; PUB_KEY_SIZE]);
        frame.extend_from_slice(&0xDDCC_BBAAu32.to_le_bytes());
        match decode_frame(&frame) {
            Some(InboundFrame::Ack { token }) => assert_eq!(token, 0xDDCC_BBAA),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(decode_frame(&[PayloadType::TxtMsg as u8, 0]).is_none());
        let mut short = vec![PayloadType::TxtMsg as u8, 0, 0];
        short.extend_from_slice(&[0u8; 5]);
        assert!(decode_frame(&short).is_none());
    }
}
