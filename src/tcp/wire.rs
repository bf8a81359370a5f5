//! Wire formats: the active-message frame header, the connection-manager
//! message shapes it carries, and the one-time magic-number prefix.
//!
//! Grounded on `original_source/src/uct/tcp/tcp_ep.c` (`uct_tcp_am_hdr_t`,
//! `UCT_TCP_AM_PREPARE`) and `tcp_cm.c` (`uct_tcp_ep_conn_pkt_t`,
//! `UCT_TCP_EP_CONN_REQ`/`_ACK`). Spec section 6, "Wire formats", fixes the
//! byte layout; this module is the only place that layout is known.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Reserved `am_id` naming a connection-manager message rather than a
/// user active message (spec section 4.4.1 / 6).
pub const CM_AM_ID: u8 = 0xFF;

/// Size in bytes of the frame header (`am_id` + `length`).
pub const FRAME_HEADER_LEN: usize = 5;

/// Fixed 64-bit value sent once by an initiator before its first frame, so
/// an acceptor can distinguish a genuine peer from a stray connection (spec
/// section 4.4.1, section 6). Crate-local: wire compatibility with any
/// external non-Rust peer is not a goal here (see `SPEC_FULL.md` section 6).
pub const CM_MAGIC: u64 = 0x5543_5443_504d_4147; // "UCTCPMAG" in ASCII, reversed by LE encoding

pub const MAGIC_LEN: usize = 8;

/// Writes a frame header + payload into `out`.
pub fn encode_frame(am_id: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.push(am_id);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// A fully-parsed frame header: the payload bytes start right after it.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub am_id: u8,
    pub length: u32,
}

/// Parses a frame header from the front of `buf`, if at least
/// [`FRAME_HEADER_LEN`] bytes are present.
pub fn parse_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let am_id = buf[0];
    let length = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Some(FrameHeader { am_id, length })
}

/// A connection-manager message, carried as the payload of a frame with
/// `am_id == CM_AM_ID` (spec section 4.4.1, section 6).
#[derive(Debug, Clone, Copy)]
pub enum CmMessage {
    ConnReq { iface_addr: SocketAddrV4, conn_id: u32 },
    ConnAck,
    ConnAckReq { iface_addr: SocketAddrV4, conn_id: u32 },
}

const EVENT_CONN_REQ: u8 = 1;
const EVENT_CONN_ACK: u8 = 2;
const EVENT_CONN_ACK_REQ: u8 = 3;

impl CmMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            CmMessage::ConnReq { iface_addr, conn_id } => {
                encode_req_shaped(EVENT_CONN_REQ, *iface_addr, *conn_id)
            }
            CmMessage::ConnAck => vec![EVENT_CONN_ACK],
            CmMessage::ConnAckReq { iface_addr, conn_id } => {
                encode_req_shaped(EVENT_CONN_ACK_REQ, *iface_addr, *conn_id)
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Option<CmMessage> {
        let event = *payload.first()?;
        match event {
            EVENT_CONN_ACK => Some(CmMessage::ConnAck),
            EVENT_CONN_REQ | EVENT_CONN_ACK_REQ => {
                let (iface_addr, conn_id) = decode_req_shaped(&payload[1..])?;
                Some(if event == EVENT_CONN_REQ {
                    CmMessage::ConnReq { iface_addr, conn_id }
                } else {
                    CmMessage::ConnAckReq { iface_addr, conn_id }
                })
            }
            _ => None,
        }
    }
}

fn encode_req_shaped(event: u8, addr: SocketAddrV4, conn_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + 2 + 4);
    out.push(event);
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&addr.port().to_le_bytes());
    out.extend_from_slice(&conn_id.to_le_bytes());
    out
}

fn decode_req_shaped(rest: &[u8]) -> Option<(SocketAddrV4, u32)> {
    if rest.len() < 10 {
        return None;
    }
    let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
    let port = u16::from_le_bytes([rest[4], rest[5]]);
    let conn_id = u32::from_le_bytes([rest[6], rest[7], rest[8], rest[9]]);
    Some((SocketAddrV4::new(ip, port), conn_id))
}

/// Total order over socket addresses used to break simultaneous-connect
/// ties (spec section 4.4.1: "compares its own interface address against
/// the peer's with a total order on the packed socket address"). IPv4 only,
/// matching the `sockaddr_in` wire shape.
pub fn addr_order(a: &SocketAddr, b: &SocketAddr) -> std::cmp::Ordering {
    fn key(a: &SocketAddr) -> (u32, u16) {
        match a {
            SocketAddr::V4(v4) => (u32::from(*v4.ip()), v4.port()),
            SocketAddr::V6(_) => (u32::MAX, 0),
        }
    }
    key(a).cmp(&key(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_header() {
        let mut buf = Vec::new();
        encode_frame(7, &[1, 2, 3, 4], &mut buf);
        let hdr = parse_frame_header(&buf).unwrap();
        assert_eq!(hdr.am_id, 7);
        assert_eq!(hdr.length, 4);
        assert_eq!(&buf[FRAME_HEADER_LEN..], &[1, 2, 3, 4]);
    }

    #[test]
    fn conn_req_round_trips() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4242);
        let msg = CmMessage::ConnReq {
            iface_addr: addr,
            conn_id: 9,
        };
        let encoded = msg.encode();
        match CmMessage::decode(&encoded).unwrap() {
            CmMessage::ConnReq { iface_addr, conn_id } => {
                assert_eq!(iface_addr, addr);
                assert_eq!(conn_id, 9);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn conn_ack_round_trips() {
        let encoded = CmMessage::ConnAck.encode();
        assert!(matches!(CmMessage::decode(&encoded), Some(CmMessage::ConnAck)));
    }

    #[test]
    fn address_order_is_total_and_consistent() {
        let a: SocketAddr = "10.0.0.1:5".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5".parse().unwrap();
        assert_eq!(addr_order(&a, &b), std::cmp::Ordering::Less);
        assert_eq!(addr_order(&b, &a), std::cmp::Ordering::Greater);
        assert_eq!(addr_order(&a, &a), std::cmp::Ordering::Equal);
    }
}
