//! Session handler: the single owner of session state.
//!
//! Packets from the ingest loop and events from the upstream reactor both
//! land here. Each mutates its session only while holding that session's
//! lock, so the two threads never interleave on one flow.

mod tcp;
mod udp;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::capture::{CaptureMode, RedirectionRule};
use crate::icmp::IcmpResponder;
use crate::mux::{Multiplexer, MuxError, ReadControl, UpstreamError, UpstreamEvents, UpstreamHandle};
use crate::packet::{self, Ipv4Info, IcmpEcho, PacketError, Transport};
use crate::session::table::IdleTimeouts;
use crate::session::{
    FlowKey, Protocol, RedirectTarget, Session, SessionRef, SessionTable, TcpControl, TcpState,
};
use crate::writer::PacketQueue;

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub rule: RedirectionRule,
    pub capture: CaptureMode,
    pub mtu: usize,
    pub timeouts: IdleTimeouts,
}

#[derive(Debug)]
pub struct SessionHandler {
    config: HandlerConfig,
    table: SessionTable,
    mux: Multiplexer,
    out: Arc<PacketQueue>,
    icmp: Option<IcmpResponder>,
}

impl SessionHandler {
    pub fn new(config: HandlerConfig, mux: Multiplexer, out: Arc<PacketQueue>) -> Self {
        SessionHandler {
            config,
            table: SessionTable::new(),
            mux,
            out,
            icmp: None,
        }
    }

    #[must_use]
    pub fn with_icmp(mut self, icmp: IcmpResponder) -> Self {
        self.icmp = Some(icmp);
        self
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    /// Process one raw packet read from the tunnel. Never fails: anything
    /// unusable is logged and dropped.
    pub fn handle_packet(&self, buf: &[u8]) {
        let packet = match packet::parse(buf) {
            Ok(packet) => packet,
            Err(PacketError::Empty) => return,
            Err(e) => {
                debug!(len = buf.len(), error = %e, "packet_dropped");
                return;
            }
        };
        match &packet.transport {
            Transport::Tcp(segment) => self.handle_tcp(&packet.ip, segment),
            Transport::Udp(datagram) => self.handle_udp(&packet.ip, datagram),
            Transport::IcmpEcho(echo) => self.handle_icmp(&packet.ip, echo),
            Transport::IcmpOther(kind) => {
                trace!(icmp_type = *kind, dst = %packet.ip.dst, "icmp_ignored");
            }
        }
    }

    fn handle_icmp(&self, ip: &Ipv4Info, echo: &IcmpEcho<'_>) {
        match &self.icmp {
            Some(responder) => {
                responder.submit(ip.src, ip.dst, echo);
            }
            None => trace!(dst = %ip.dst, "icmp_echo_ignored"),
        }
    }

    /// Evict sessions past their idle limit. Returns how many were removed.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for session_ref in self.table.snapshot() {
            let mut session = session_ref.lock();
            if !self.config.timeouts.is_expired(&session, now) {
                continue;
            }
            if !session.closed {
                self.reset_client(&session);
            }
            self.end_session(&session_ref, &mut session, "idle");
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.table.len(), "sessions_swept");
        }
        evicted
    }

    /// Close every session and its upstream socket.
    pub fn shutdown_all(&self) {
        let sessions = self.table.drain();
        let count = sessions.len();
        for session_ref in sessions {
            let mut session = session_ref.lock();
            self.close_upstream(&mut session);
        }
        debug!(count, "sessions_shutdown");
    }

    // ── Shared helpers ───────────────────────────────────────────────────────

    fn emit(&self, key: &FlowKey, packet: Result<Bytes, PacketError>) {
        match packet {
            Ok(bytes) => {
                if !self.out.push(bytes) {
                    trace!(flow = %key, "packet_not_queued");
                }
            }
            Err(e) => warn!(flow = %key, error = %e, "packet_build_failed"),
        }
    }

    /// Open the upstream socket before the session becomes visible, so reactor
    /// events for it always find a matching handle.
    fn open_upstream(
        &self,
        key: FlowKey,
        target: RedirectTarget,
        tcp: Option<TcpControl>,
    ) -> Result<Session, MuxError> {
        let handle = self.mux.register(key, target.connect_addr())?;
        let mut session = Session::new(key, target, tcp);
        session.upstream = Some(handle);
        Ok(session)
    }

    fn close_upstream(&self, session: &mut Session) {
        session.closed = true;
        if let Some(tcp) = session.tcp.as_mut() {
            tcp.state = TcpState::Closed;
        }
        if let Some(handle) = session.upstream.take() {
            self.mux.close(handle);
        }
    }

    fn end_session(&self, session_ref: &SessionRef, session: &mut Session, reason: &'static str) {
        if !session.closed {
            debug!(
                flow = %session.key,
                reason,
                age_ms = session.created_at.elapsed().as_millis() as u64,
                "session_closed"
            );
        }
        self.close_upstream(session);
        self.table.remove(&session.key, session_ref);
    }

    /// Run `f` on the live session that owns `handle`. Events for sessions
    /// that were closed or replaced in the meantime are dropped.
    fn with_session<R>(
        &self,
        handle: UpstreamHandle,
        key: &FlowKey,
        f: impl FnOnce(&SessionRef, &mut Session) -> R,
    ) -> Option<R> {
        let session_ref = self.table.get(key)?;
        let mut session = session_ref.lock();
        if session.closed || session.upstream != Some(handle) {
            trace!(flow = %key, handle = %handle, "stale_upstream_event");
            return None;
        }
        Some(f(&session_ref, &mut *session))
    }
}

impl UpstreamEvents for SessionHandler {
    fn on_connected(&self, handle: UpstreamHandle, key: &FlowKey) {
        if key.protocol == Protocol::Tcp {
            self.tcp_upstream_connected(handle, key);
        }
    }

    fn on_data(&self, handle: UpstreamHandle, key: &FlowKey, data: &[u8]) -> ReadControl {
        match key.protocol {
            Protocol::Tcp => self.tcp_upstream_data(handle, key, data),
            Protocol::Udp => self.udp_upstream_data(handle, key, data),
        }
    }

    fn on_eof(&self, handle: UpstreamHandle, key: &FlowKey) {
        if key.protocol == Protocol::Tcp {
            self.tcp_upstream_eof(handle, key);
        }
    }

    fn on_error(&self, handle: UpstreamHandle, key: &FlowKey, error: UpstreamError) {
        match key.protocol {
            Protocol::Tcp => self.tcp_upstream_failed(handle, key, error),
            Protocol::Udp => self.udp_upstream_failed(handle, key, error),
        }
    }
}

