//! IPv4 packet codec.
//!
//! Parsing borrows from the caller's buffer; everything handed to the tunnel
//! is produced by [`builder`] with freshly computed checksums.

pub mod builder;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::BitOr;

use etherparse::{Icmpv4Header, Icmpv4Type, IpNumber, Ipv4Header, TcpHeader, TcpOptionElement, UdpHeader};
use thiserror::Error;

/// Largest packet the writer will hand to the tunnel.
pub const MAX_WRITE_LEN: usize = 30000;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("fragmented packets are not supported")]
    Fragmented,

    #[error("malformed {layer} header: {reason}")]
    Malformed { layer: &'static str, reason: String },

    #[error("packet of {0} bytes exceeds the writable limit")]
    TooLarge(usize),

    #[error("cannot build packet: {0}")]
    Build(String),
}

// ── TCP flags ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    #[must_use]
    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn from_header(header: &TcpHeader) -> Self {
        let mut bits = 0u8;
        if header.fin {
            bits |= Self::FIN.0;
        }
        if header.syn {
            bits |= Self::SYN.0;
        }
        if header.rst {
            bits |= Self::RST.0;
        }
        if header.psh {
            bits |= Self::PSH.0;
        }
        if header.ack {
            bits |= Self::ACK.0;
        }
        TcpFlags(bits)
    }

    fn apply(self, header: &mut TcpHeader) {
        header.fin = self.contains(Self::FIN);
        header.syn = self.contains(Self::SYN);
        header.rst = self.contains(Self::RST);
        header.psh = self.contains(Self::PSH);
        header.ack = self.contains(Self::ACK);
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SYN, 'S'),
            (Self::ACK, 'A'),
            (Self::PSH, 'P'),
            (Self::FIN, 'F'),
            (Self::RST, 'R'),
        ];
        let mut wrote = false;
        for (flag, name) in names {
            if self.contains(flag) {
                write!(f, "{name}")?;
                wrote = true;
            }
        }
        if !wrote {
            write!(f, "-")?;
        }
        Ok(())
    }
}

// ── Parsed views ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Info {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    /// (TSval, TSecr) from the timestamp option.
    pub timestamp: Option<(u32, u32)>,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    #[must_use]
    pub fn is(&self, flag: TcpFlags) -> bool {
        self.flags.contains(flag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho<'a> {
    pub id: u16,
    pub seq: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    IcmpEcho(IcmpEcho<'a>),
    /// ICMP messages other than echo requests; dropped by the handler.
    IcmpOther(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    pub ip: Ipv4Info,
    pub transport: Transport<'a>,
}

impl Packet<'_> {
    #[must_use]
    pub fn source(&self) -> Option<SocketAddrV4> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(SocketAddrV4::new(self.ip.src, tcp.src_port)),
            Transport::Udp(udp) => Some(SocketAddrV4::new(self.ip.src, udp.src_port)),
            Transport::IcmpEcho(_) | Transport::IcmpOther(_) => None,
        }
    }

    #[must_use]
    pub fn destination(&self) -> Option<SocketAddrV4> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(SocketAddrV4::new(self.ip.dst, tcp.dst_port)),
            Transport::Udp(udp) => Some(SocketAddrV4::new(self.ip.dst, udp.dst_port)),
            Transport::IcmpEcho(_) | Transport::IcmpOther(_) => None,
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Parse one raw IPv4 packet as read from the tunnel.
pub fn parse(buf: &[u8]) -> Result<Packet<'_>, PacketError> {
    let first = *buf.first().ok_or(PacketError::Empty)?;
    let version = first >> 4;
    if version != 4 {
        return Err(PacketError::UnsupportedVersion(version));
    }

    let (header, _) = Ipv4Header::from_slice(buf).map_err(|e| PacketError::Malformed {
        layer: "ipv4",
        reason: e.to_string(),
    })?;
    if header.more_fragments || header.fragment_offset.value() != 0 {
        return Err(PacketError::Fragmented);
    }

    let header_len = header.header_len();
    let total_len = usize::from(header.total_len);
    if total_len < header_len || total_len > buf.len() {
        return Err(PacketError::Malformed {
            layer: "ipv4",
            reason: format!("total length {total_len} outside buffer of {}", buf.len()),
        });
    }
    let payload = &buf[header_len..total_len];

    let ip = Ipv4Info {
        src: Ipv4Addr::from(header.source),
        dst: Ipv4Addr::from(header.destination),
        ttl: header.time_to_live,
    };

    let transport = match header.protocol {
        IpNumber::TCP => Transport::Tcp(parse_tcp(payload)?),
        IpNumber::UDP => Transport::Udp(parse_udp(payload)?),
        IpNumber::ICMP => parse_icmp(payload)?,
        other => return Err(PacketError::UnsupportedProtocol(other.0)),
    };

    Ok(Packet { ip, transport })
}

fn parse_tcp(payload: &[u8]) -> Result<TcpSegment<'_>, PacketError> {
    let (header, data) = TcpHeader::from_slice(payload).map_err(|e| PacketError::Malformed {
        layer: "tcp",
        reason: e.to_string(),
    })?;

    let mut mss = None;
    let mut timestamp = None;
    for option in header.options_iterator() {
        match option {
            Ok(TcpOptionElement::MaximumSegmentSize(value)) => mss = Some(value),
            Ok(TcpOptionElement::Timestamp(value, echo)) => timestamp = Some((value, echo)),
            Ok(_) => {}
            // Unknown or truncated options end the walk; the header itself is fine.
            Err(_) => break,
        }
    }

    Ok(TcpSegment {
        src_port: header.source_port,
        dst_port: header.destination_port,
        seq: header.sequence_number,
        ack: header.acknowledgment_number,
        flags: TcpFlags::from_header(&header),
        window: header.window_size,
        mss,
        timestamp,
        payload: data,
    })
}

fn parse_udp(payload: &[u8]) -> Result<UdpDatagram<'_>, PacketError> {
    let (header, rest) = UdpHeader::from_slice(payload).map_err(|e| PacketError::Malformed {
        layer: "udp",
        reason: e.to_string(),
    })?;
    let declared = usize::from(header.length);
    if declared < UDP_HEADER_LEN {
        return Err(PacketError::Malformed {
            layer: "udp",
            reason: format!("length field {declared} below header size"),
        });
    }
    let data_len = (declared - UDP_HEADER_LEN).min(rest.len());
    Ok(UdpDatagram {
        src_port: header.source_port,
        dst_port: header.destination_port,
        payload: &rest[..data_len],
    })
}

fn parse_icmp(payload: &[u8]) -> Result<Transport<'_>, PacketError> {
    let (header, rest) = Icmpv4Header::from_slice(payload).map_err(|e| PacketError::Malformed {
        layer: "icmp",
        reason: e.to_string(),
    })?;
    Ok(match header.icmp_type {
        Icmpv4Type::EchoRequest(echo) => Transport::IcmpEcho(IcmpEcho {
            id: echo.id,
            seq: echo.seq,
            payload: rest,
        }),
        _ => Transport::IcmpOther(payload[0]),
    })
}

#[cfg(test)]
mod tests {
    use super::builder::{build_tcp, build_udp, TcpReply};
    use super::*;

    fn addr(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    #[test]
    fn test_parse_rejects_ipv6_and_empty() {
        assert_eq!(parse(&[]), Err(PacketError::Empty));
        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        assert_eq!(parse(&v6), Err(PacketError::UnsupportedVersion(6)));
    }

    #[test]
    fn test_parse_rejects_truncated_ipv4() {
        let buf = [0x45u8, 0, 0, 40, 0, 0];
        assert!(matches!(
            parse(&buf),
            Err(PacketError::Malformed { layer: "ipv4", .. })
        ));
    }

    #[test]
    fn test_parse_syn_reads_mss_and_timestamp() {
        let reply = TcpReply {
            seq: 1000,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 64240,
            mss: Some(1400),
            timestamp: Some((77, 0)),
            payload: &[],
        };
        let raw = build_tcp(addr([10, 0, 0, 2], 40000), addr([93, 184, 216, 34], 443), &reply)
            .expect("build syn");
        let packet = parse(&raw).expect("parse syn");

        assert_eq!(packet.ip.src, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(packet.destination(), Some(addr([93, 184, 216, 34], 443)));
        let Transport::Tcp(tcp) = packet.transport else {
            panic!("expected tcp");
        };
        assert!(tcp.is(TcpFlags::SYN));
        assert!(!tcp.is(TcpFlags::ACK));
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.mss, Some(1400));
        assert_eq!(tcp.timestamp, Some((77, 0)));
        assert!(tcp.payload.is_empty());
    }

    #[test]
    fn test_parse_ignores_trailing_bytes_past_total_length() {
        let mut raw = build_udp(addr([10, 0, 0, 2], 5353), addr([8, 8, 8, 8], 53), b"query")
            .expect("build udp")
            .to_vec();
        raw.extend_from_slice(&[0xEE; 7]);
        let packet = parse(&raw).expect("parse udp");
        let Transport::Udp(udp) = packet.transport else {
            panic!("expected udp");
        };
        assert_eq!(udp.payload, b"query");
        assert_eq!(udp.dst_port, 53);
    }

    #[test]
    fn test_parse_rejects_unknown_protocol() {
        let mut raw = build_udp(addr([10, 0, 0, 2], 1), addr([10, 0, 0, 3], 2), b"x")
            .expect("build udp")
            .to_vec();
        // GRE; header checksum is not verified by the parser.
        raw[9] = 47;
        assert_eq!(parse(&raw), Err(PacketError::UnsupportedProtocol(47)));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), "SA");
        assert_eq!((TcpFlags::FIN | TcpFlags::ACK).to_string(), "AF");
        assert_eq!(TcpFlags::empty().to_string(), "-");
    }
}
