pub mod table;

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::capture::Socks5Handshake;
use crate::mux::UpstreamHandle;

pub use table::{SessionRef, SessionTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Identity of one conversation as seen from the device: `local` is the app
/// side, `remote` the destination the app asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl FlowKey {
    #[must_use]
    pub fn new(protocol: Protocol, local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        FlowKey {
            protocol,
            local,
            remote,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}->{}", self.protocol, self.local, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynReceived,
    Established,
    /// We sent FIN after the upstream closed; waiting for the app.
    FinWait,
    /// The app sent FIN; upstream may still be talking.
    CloseWait,
    /// Both sides sent FIN; waiting for the app to ack ours.
    LastAck,
}

impl TcpState {
    /// States where the handshake or teardown is still in flight.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            TcpState::SynReceived | TcpState::FinWait | TcpState::LastAck
        )
    }
}

/// Where the upstream socket actually connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectTarget {
    PassThrough(SocketAddrV4),
    Proxy(SocketAddr),
}

impl RedirectTarget {
    #[must_use]
    pub fn connect_addr(self) -> SocketAddr {
        match self {
            RedirectTarget::PassThrough(addr) => SocketAddr::V4(addr),
            RedirectTarget::Proxy(addr) => addr,
        }
    }

    #[must_use]
    pub fn is_redirected(self) -> bool {
        matches!(self, RedirectTarget::Proxy(_))
    }
}

/// TCP bookkeeping. Sequence numbers are ours toward the app (`snd_*`) and
/// the app's toward us (`rcv_next`).
#[derive(Debug)]
pub struct TcpControl {
    pub state: TcpState,
    pub isn: u32,
    pub snd_una: u32,
    pub snd_next: u32,
    pub rcv_next: u32,
    pub peer_window: u16,
    pub peer_mss: Option<u16>,
    /// Last TSval seen from the app, echoed in our segments.
    pub peer_ts: Option<u32>,
    pub fin_sent: bool,
    /// Segments that arrived ahead of `rcv_next`, keyed by sequence number.
    pub reorder: BTreeMap<u32, Bytes>,
    pub reorder_bytes: usize,
    pub socks: Option<Socks5Handshake>,
    /// App bytes held until the proxy handshake completes.
    pub held_for_upstream: BytesMut,
    /// App sent FIN before the proxy handshake finished.
    pub shutdown_pending: bool,
}

impl TcpControl {
    #[must_use]
    pub fn new(isn: u32, client_seq: u32, window: u16, mss: Option<u16>, ts: Option<u32>) -> Self {
        TcpControl {
            state: TcpState::SynReceived,
            isn,
            snd_una: isn,
            snd_next: isn.wrapping_add(1),
            rcv_next: client_seq.wrapping_add(1),
            peer_window: window,
            peer_mss: mss,
            peer_ts: ts,
            fin_sent: false,
            reorder: BTreeMap::new(),
            reorder_bytes: 0,
            socks: None,
            held_for_upstream: BytesMut::new(),
            shutdown_pending: false,
        }
    }

    /// Bytes sent to the app that it has not acknowledged yet.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.snd_next.wrapping_sub(self.snd_una)
    }
}

#[derive(Debug)]
pub struct Session {
    pub key: FlowKey,
    pub target: RedirectTarget,
    pub upstream: Option<UpstreamHandle>,
    pub upstream_connected: bool,
    pub upstream_eof: bool,
    pub read_paused: bool,
    /// Upstream bytes not yet segmented toward the app.
    pub to_device: BytesMut,
    pub tcp: Option<TcpControl>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub closed: bool,
}

impl Session {
    #[must_use]
    pub fn new(key: FlowKey, target: RedirectTarget, tcp: Option<TcpControl>) -> Self {
        let now = Instant::now();
        Session {
            key,
            target,
            upstream: None,
            upstream_connected: false,
            upstream_eof: false,
            read_paused: false,
            to_device: BytesMut::new(),
            tcp,
            created_at: now,
            last_activity: now,
            closed: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn tcp_state(&self) -> Option<TcpState> {
        self.tcp.as_ref().map(|tcp| tcp.state)
    }

    /// Address replies to the app are sent from.
    #[must_use]
    pub fn reply_src(&self) -> SocketAddrV4 {
        self.key.remote
    }

    #[must_use]
    pub fn reply_dst(&self) -> SocketAddrV4 {
        self.key.local
    }
}
