use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use etherparse::{
    IcmpEchoHeader, Icmpv4Header, Icmpv4Type, IpNumber, Ipv4Header, TcpHeader, TcpOptionElement,
    UdpHeader,
};

use super::{PacketError, TcpFlags, MAX_WRITE_LEN};

const DEFAULT_TTL: u8 = 64;

/// Fields of a synthesized TCP segment. Addresses come separately so the
/// same reply can be built for either direction.
#[derive(Debug, Clone)]
pub struct TcpReply<'a> {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub timestamp: Option<(u32, u32)>,
    pub payload: &'a [u8],
}

impl<'a> TcpReply<'a> {
    #[must_use]
    pub fn control(seq: u32, ack: u32, flags: TcpFlags, window: u16) -> Self {
        TcpReply {
            seq,
            ack,
            flags,
            window,
            mss: None,
            timestamp: None,
            payload: &[],
        }
    }
}

fn ipv4_header(
    payload_len: usize,
    protocol: IpNumber,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<Ipv4Header, PacketError> {
    let len = u16::try_from(payload_len).map_err(|_| PacketError::TooLarge(payload_len))?;
    let mut header = Ipv4Header::new(len, DEFAULT_TTL, protocol, src.octets(), dst.octets())
        .map_err(|e| PacketError::Build(e.to_string()))?;
    header.dont_fragment = true;
    Ok(header)
}

fn finish(packet: Vec<u8>) -> Result<Bytes, PacketError> {
    if packet.len() > MAX_WRITE_LEN {
        return Err(PacketError::TooLarge(packet.len()));
    }
    Ok(Bytes::from(packet))
}

/// Serialize a TCP segment from `src` to `dst` with IP and TCP checksums filled in.
pub fn build_tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    reply: &TcpReply<'_>,
) -> Result<Bytes, PacketError> {
    let mut tcp = TcpHeader::new(src.port(), dst.port(), reply.seq, reply.window);
    tcp.acknowledgment_number = reply.ack;
    reply.flags.apply(&mut tcp);

    let mut options = Vec::with_capacity(3);
    if let Some(mss) = reply.mss {
        options.push(TcpOptionElement::MaximumSegmentSize(mss));
    }
    if let Some((value, echo)) = reply.timestamp {
        options.push(TcpOptionElement::Noop);
        options.push(TcpOptionElement::Noop);
        options.push(TcpOptionElement::Timestamp(value, echo));
    }
    if !options.is_empty() {
        tcp.set_options(&options)
            .map_err(|e| PacketError::Build(format!("tcp options: {e:?}")))?;
    }

    let tcp_len = usize::from(tcp.header_len()) + reply.payload.len();
    let ip = ipv4_header(tcp_len, IpNumber::TCP, *src.ip(), *dst.ip())?;
    tcp.checksum = tcp
        .calc_checksum_ipv4(&ip, reply.payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    let mut packet = Vec::with_capacity(ip.header_len() + tcp_len);
    ip.write(&mut packet)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    tcp.write(&mut packet)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    packet.extend_from_slice(reply.payload);
    finish(packet)
}

pub fn build_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Bytes, PacketError> {
    let udp_len = super::UDP_HEADER_LEN + payload.len();
    let ip = ipv4_header(udp_len, IpNumber::UDP, *src.ip(), *dst.ip())?;
    let udp = UdpHeader::with_ipv4_checksum(src.port(), dst.port(), &ip, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    let mut packet = Vec::with_capacity(ip.header_len() + udp_len);
    ip.write(&mut packet)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    udp.write(&mut packet)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    packet.extend_from_slice(payload);
    finish(packet)
}

pub fn build_icmp_echo_reply(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    seq: u16,
    payload: &[u8],
) -> Result<Bytes, PacketError> {
    let icmp = Icmpv4Header::with_checksum(Icmpv4Type::EchoReply(IcmpEchoHeader { id, seq }), payload);
    let icmp_len = icmp.header_len() + payload.len();
    let ip = ipv4_header(icmp_len, IpNumber::ICMP, src, dst)?;

    let mut packet = Vec::with_capacity(ip.header_len() + icmp_len);
    ip.write(&mut packet)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    icmp.write(&mut packet)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    packet.extend_from_slice(payload);
    finish(packet)
}

/// Sequence/ack pair for a reset answering a segment nobody owns.
///
/// If the offending segment acknowledged something, the reset takes its
/// sequence number from that ack; otherwise it acknowledges the segment.
#[must_use]
pub fn reset_numbers(seg_seq: u32, seg_ack: Option<u32>, seg_len: u32) -> (u32, u32) {
    match seg_ack {
        Some(ack) if ack > 0 => (ack, 0),
        _ => (0, seg_seq.wrapping_add(seg_len)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse, Transport};

    fn addr(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    fn checksum_ok(bytes: &[u8]) -> bool {
        let (ip, rest) = Ipv4Header::from_slice(bytes).expect("ip header");
        let expected = ip.calc_header_checksum();
        let (tcp, payload) = TcpHeader::from_slice(rest).expect("tcp header");
        let tcp_sum = tcp
            .calc_checksum_ipv4(&ip, payload)
            .expect("tcp checksum");
        ip.header_checksum == expected && tcp.checksum == tcp_sum
    }

    #[test]
    fn test_build_tcp_data_segment_has_valid_checksums() {
        let reply = TcpReply {
            seq: 5000,
            ack: 9001,
            flags: TcpFlags::ACK | TcpFlags::PSH,
            window: 65535,
            mss: None,
            timestamp: Some((10, 20)),
            payload: b"HTTP/1.1 200 OK\r\n\r\n",
        };
        let raw = build_tcp(addr([1, 1, 1, 1], 80), addr([10, 0, 0, 2], 40000), &reply)
            .expect("build");
        assert!(checksum_ok(&raw));

        let packet = parse(&raw).expect("parse");
        let Transport::Tcp(tcp) = packet.transport else {
            panic!("expected tcp");
        };
        assert_eq!(tcp.seq, 5000);
        assert_eq!(tcp.ack, 9001);
        assert_eq!(tcp.flags, TcpFlags::ACK | TcpFlags::PSH);
        assert_eq!(tcp.timestamp, Some((10, 20)));
        assert_eq!(tcp.payload, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[test]
    fn test_build_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_WRITE_LEN];
        let err = build_udp(addr([1, 1, 1, 1], 53), addr([10, 0, 0, 2], 5000), &payload)
            .expect_err("too large");
        assert!(matches!(err, PacketError::TooLarge(_)));
    }

    #[test]
    fn test_build_icmp_echo_reply_roundtrips_identity() {
        let raw = build_icmp_echo_reply(
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(10, 0, 0, 2),
            7,
            3,
            b"ping-data",
        )
        .expect("build");
        let (ip, rest) = Ipv4Header::from_slice(&raw).expect("ip header");
        assert_eq!(ip.protocol, IpNumber::ICMP);
        let (icmp, payload) = Icmpv4Header::from_slice(rest).expect("icmp header");
        assert_eq!(
            icmp.icmp_type,
            Icmpv4Type::EchoReply(IcmpEchoHeader { id: 7, seq: 3 })
        );
        assert_eq!(payload, b"ping-data");
    }

    #[test]
    fn test_reset_numbers_follow_ack_presence() {
        assert_eq!(reset_numbers(100, Some(555), 10), (555, 0));
        assert_eq!(reset_numbers(100, None, 10), (0, 110));
        assert_eq!(reset_numbers(u32::MAX, None, 2), (0, 1));
    }
}
