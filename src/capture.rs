//! Redirection decisions and the proxy-side handshake for redirected flows.

use std::collections::BTreeSet;
use std::net::{SocketAddr, SocketAddrV4};

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{Protocol, RedirectTarget};

pub const DEFAULT_REDIRECT_PORTS: [u16; 8] = [80, 443, 4443, 8000, 8080, 8443, 8888, 9000];

// SOCKS5 constants
const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Connect straight to the proxy and pass the app's bytes through.
    #[default]
    Raw,
    /// Ask the proxy to CONNECT to the original destination first.
    Socks5,
}

/// Ports whose TCP flows are sent to the proxy. Fixed for an engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectionRule {
    proxy: SocketAddr,
    ports: BTreeSet<u16>,
}

impl RedirectionRule {
    pub fn new(proxy: SocketAddr, ports: impl IntoIterator<Item = u16>) -> Self {
        RedirectionRule {
            proxy,
            ports: ports.into_iter().filter(|p| *p != 0).collect(),
        }
    }

    #[must_use]
    pub fn proxy(&self) -> SocketAddr {
        self.proxy
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().copied()
    }

    /// Traffic already headed for the proxy is never looped back into it.
    #[must_use]
    pub fn should_redirect(&self, dest: SocketAddrV4) -> bool {
        SocketAddr::V4(dest) != self.proxy && self.ports.contains(&dest.port())
    }

    /// UDP always goes to its real destination; the proxy only speaks TCP.
    #[must_use]
    pub fn target_for(&self, protocol: Protocol, dest: SocketAddrV4) -> RedirectTarget {
        match protocol {
            Protocol::Tcp if self.should_redirect(dest) => RedirectTarget::Proxy(self.proxy),
            _ => RedirectTarget::PassThrough(dest),
        }
    }
}

// ── SOCKS5 client handshake ──────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("proxy answered with SOCKS version {0}")]
    Version(u8),

    #[error("proxy rejected no-auth method (selected {0:#04x})")]
    AuthRejected(u8),

    #[error("proxy refused CONNECT with reply code {0:#04x}")]
    ConnectRefused(u8),

    #[error("unsupported SOCKS5 address type {0}")]
    AddressType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AwaitMethod,
    AwaitConnectReply,
    Done,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutput {
    NeedMore,
    /// Bytes to write to the proxy before anything else.
    Send(Bytes),
    /// Tunnel is up; `leftover` is already application data.
    Established { leftover: Bytes },
}

/// Non-blocking SOCKS5 CONNECT exchange, fed with whatever the proxy sends.
#[derive(Debug)]
pub struct Socks5Handshake {
    step: Step,
    dest: SocketAddrV4,
    buffer: BytesMut,
}

impl Socks5Handshake {
    /// Returns the handshake and the greeting to send once connected.
    #[must_use]
    pub fn start(dest: SocketAddrV4) -> (Self, Bytes) {
        let handshake = Socks5Handshake {
            step: Step::AwaitMethod,
            dest,
            buffer: BytesMut::new(),
        };
        (
            handshake,
            Bytes::from_static(&[SOCKS_VERSION, 1, AUTH_NONE]),
        )
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.step == Step::Done
    }

    fn connect_request(&self) -> Bytes {
        let mut req = Vec::with_capacity(10);
        req.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4]);
        req.extend_from_slice(&self.dest.ip().octets());
        req.extend_from_slice(&self.dest.port().to_be_bytes());
        Bytes::from(req)
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<HandshakeOutput, CaptureError> {
        self.buffer.extend_from_slice(data);
        match self.step {
            Step::AwaitMethod => {
                if self.buffer.len() < 2 {
                    return Ok(HandshakeOutput::NeedMore);
                }
                if self.buffer[0] != SOCKS_VERSION {
                    return Err(CaptureError::Version(self.buffer[0]));
                }
                if self.buffer[1] != AUTH_NONE {
                    return Err(CaptureError::AuthRejected(self.buffer[1]));
                }
                self.buffer.advance(2);
                self.step = Step::AwaitConnectReply;
                Ok(HandshakeOutput::Send(self.connect_request()))
            }
            Step::AwaitConnectReply => {
                let Some(reply_len) = self.connect_reply_len()? else {
                    return Ok(HandshakeOutput::NeedMore);
                };
                if self.buffer.len() < reply_len {
                    return Ok(HandshakeOutput::NeedMore);
                }
                self.buffer.advance(reply_len);
                self.step = Step::Done;
                let leftover = std::mem::take(&mut self.buffer).freeze();
                Ok(HandshakeOutput::Established { leftover })
            }
            Step::Done => {
                let leftover = std::mem::take(&mut self.buffer).freeze();
                Ok(HandshakeOutput::Established { leftover })
            }
        }
    }

    /// Total reply length once enough of the header is buffered to know it.
    fn connect_reply_len(&self) -> Result<Option<usize>, CaptureError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        if self.buffer[0] != SOCKS_VERSION {
            return Err(CaptureError::Version(self.buffer[0]));
        }
        if self.buffer[1] != REP_SUCCESS {
            return Err(CaptureError::ConnectRefused(self.buffer[1]));
        }
        let len = match self.buffer[3] {
            ATYP_IPV4 => 4 + 4 + 2,
            ATYP_IPV6 => 4 + 16 + 2,
            ATYP_DOMAIN => match self.buffer.get(4) {
                Some(name_len) => 4 + 1 + usize::from(*name_len) + 2,
                None => return Ok(None),
            },
            other => return Err(CaptureError::AddressType(other)),
        };
        Ok(Some(len))
    }
}
