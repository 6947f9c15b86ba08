//! TCP toward the app.
//!
//! We terminate the app's connection here and speak plain stream bytes to
//! the upstream socket. Sequence numbers are ours; the app never sees the
//! real server's.

use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::SessionHandler;
use crate::capture::{CaptureMode, HandshakeOutput, Socks5Handshake};
use crate::mux::{MuxError, ReadControl, UpstreamError, UpstreamHandle};
use crate::packet::builder::{build_tcp, reset_numbers, TcpReply};
use crate::packet::{Ipv4Info, TcpFlags, TcpSegment, IPV4_HEADER_LEN, TCP_HEADER_LEN};
use crate::session::{FlowKey, Protocol, Session, SessionRef, TcpControl, TcpState};

/// Window scaling is never negotiated, so this is the real receive window.
const RECEIVE_WINDOW: u16 = 65535;
/// Segment size toward apps that did not announce an MSS.
const DEFAULT_SEGMENT: u16 = 1024;
const REORDER_LIMIT: usize = 256 * 1024;
const PAUSE_ABOVE: usize = 1024 * 1024;
const RESUME_BELOW: usize = 256 * 1024;

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Sequence space a segment occupies: payload plus one each for SYN and FIN.
fn segment_len(seg: &TcpSegment<'_>) -> u32 {
    let mut len = seg.payload.len() as u32;
    if seg.is(TcpFlags::SYN) {
        len += 1;
    }
    if seg.is(TcpFlags::FIN) {
        len += 1;
    }
    len
}

/// Millisecond clock for TSval; wraps.
fn ts_value(session: &Session) -> u32 {
    session.created_at.elapsed().as_millis() as u32
}

#[derive(Debug, Default)]
struct Accepted {
    /// In-order bytes ready for the upstream socket.
    chunks: Vec<Bytes>,
    ack: bool,
    fin: bool,
}

/// Pull buffered segments that now line up with `rcv_next`.
fn take_in_order(tcp: &mut TcpControl) -> Vec<Bytes> {
    let mut ready = Vec::new();
    loop {
        let rcv_next = tcp.rcv_next;
        let Some(seq) = tcp.reorder.keys().copied().find(|s| seq_le(*s, rcv_next)) else {
            break;
        };
        let Some(chunk) = tcp.reorder.remove(&seq) else {
            break;
        };
        tcp.reorder_bytes -= chunk.len();
        let seen = rcv_next.wrapping_sub(seq) as usize;
        if seen < chunk.len() {
            let fresh = chunk.slice(seen..);
            tcp.rcv_next = rcv_next.wrapping_add(fresh.len() as u32);
            ready.push(fresh);
        }
    }
    ready
}

/// A reset counts only when it lands inside the window we advertise.
fn rst_in_window(tcp: &TcpControl, seq: u32) -> bool {
    seq.wrapping_sub(tcp.rcv_next) < u32::from(RECEIVE_WINDOW)
}

fn accept_segment(tcp: &mut TcpControl, seg: &TcpSegment<'_>) -> Accepted {
    let mut accepted = Accepted::default();
    let len = seg.payload.len();

    if len > 0 {
        accepted.ack = true;
        if seq_le(seg.seq, tcp.rcv_next) {
            // In order, or a retransmit that may still carry something new.
            let seen = tcp.rcv_next.wrapping_sub(seg.seq) as usize;
            if seen < len {
                let fresh = Bytes::copy_from_slice(&seg.payload[seen..]);
                tcp.rcv_next = tcp.rcv_next.wrapping_add(fresh.len() as u32);
                accepted.chunks.push(fresh);
                accepted.chunks.extend(take_in_order(tcp));
            }
        } else if seg.seq.wrapping_sub(tcp.rcv_next) >= u32::from(RECEIVE_WINDOW) {
            trace!(seq = seg.seq, rcv_next = tcp.rcv_next, "tcp_segment_outside_window");
        } else if tcp.reorder_bytes + len > REORDER_LIMIT {
            trace!(buffered = tcp.reorder_bytes, "tcp_reorder_full");
        } else if !tcp.reorder.contains_key(&seg.seq) {
            tcp.reorder.insert(seg.seq, Bytes::copy_from_slice(seg.payload));
            tcp.reorder_bytes += len;
        }
    }

    if seg.is(TcpFlags::FIN) {
        accepted.ack = true;
        if seg.seq.wrapping_add(len as u32) == tcp.rcv_next {
            tcp.rcv_next = tcp.rcv_next.wrapping_add(1);
            accepted.fin = true;
        }
    }
    accepted
}

impl SessionHandler {
    pub(super) fn handle_tcp(&self, ip: &Ipv4Info, seg: &TcpSegment<'_>) {
        let key = FlowKey::new(
            Protocol::Tcp,
            SocketAddrV4::new(ip.src, seg.src_port),
            SocketAddrV4::new(ip.dst, seg.dst_port),
        );
        trace!(
            flow = %key,
            flags = %seg.flags,
            seq = seg.seq,
            ack = seg.ack,
            len = seg.payload.len(),
            "tcp_in"
        );

        if let Some(session_ref) = self.table.get(&key) {
            let mut session = session_ref.lock();
            if !session.closed {
                self.tcp_segment(&session_ref, &mut session, seg);
                return;
            }
            self.table.remove(&key, &session_ref);
        }

        if seg.is(TcpFlags::SYN) && !seg.is(TcpFlags::ACK) && !seg.is(TcpFlags::RST) {
            self.open_tcp(key, seg);
        } else {
            self.reply_to_stray(key, seg);
        }
    }

    fn open_tcp(&self, key: FlowKey, seg: &TcpSegment<'_>) {
        let target = self.config.rule.target_for(Protocol::Tcp, key.remote);
        let socks = target.is_redirected() && self.config.capture == CaptureMode::Socks5;

        let opened = self.table.get_or_try_insert(key, || -> Result<Session, MuxError> {
            let mut tcp = TcpControl::new(
                rand::random(),
                seg.seq,
                seg.window,
                seg.mss,
                seg.timestamp.map(|(value, _)| value),
            );
            let greeting = socks.then(|| {
                let (handshake, greeting) = Socks5Handshake::start(key.remote);
                tcp.socks = Some(handshake);
                greeting
            });
            let session = self.open_upstream(key, target, Some(tcp))?;
            // Queued until the connect completes.
            if let (Some(handle), Some(greeting)) = (session.upstream, greeting) {
                self.mux.send(handle, greeting);
            }
            Ok(session)
        });

        match opened {
            Ok((session_ref, created)) => {
                let session = session_ref.lock();
                if created {
                    debug!(
                        flow = %key,
                        target = %target.connect_addr(),
                        redirected = target.is_redirected(),
                        "tcp_session_opened"
                    );
                }
                self.send_syn_ack(&session);
            }
            Err(e) => {
                warn!(flow = %key, error = %e, "tcp_flow_dropped");
                self.reply_to_stray(key, seg);
            }
        }
    }

    /// Answer a segment that belongs to no session.
    fn reply_to_stray(&self, key: FlowKey, seg: &TcpSegment<'_>) {
        if seg.is(TcpFlags::RST) {
            return;
        }
        let len = segment_len(seg);
        let reply = if seg.is(TcpFlags::FIN) {
            TcpReply::control(seg.ack, seg.seq.wrapping_add(len), TcpFlags::ACK, RECEIVE_WINDOW)
        } else {
            let acked = seg.is(TcpFlags::ACK).then_some(seg.ack);
            let (seq, ack) = reset_numbers(seg.seq, acked, len);
            let flags = if acked.is_some_and(|a| a > 0) {
                TcpFlags::RST
            } else {
                TcpFlags::RST | TcpFlags::ACK
            };
            TcpReply::control(seq, ack, flags, 0)
        };
        debug!(flow = %key, flags = %seg.flags, reply = %reply.flags, "tcp_stray_segment");
        self.emit(&key, build_tcp(key.remote, key.local, &reply));
    }

    fn tcp_segment(&self, session_ref: &SessionRef, session: &mut Session, seg: &TcpSegment<'_>) {
        session.touch();

        if seg.is(TcpFlags::RST) {
            if session.tcp.as_ref().is_some_and(|tcp| rst_in_window(tcp, seg.seq)) {
                self.end_session(session_ref, session, "client_reset");
            } else {
                trace!(flow = %session.key, seq = seg.seq, "tcp_reset_outside_window");
            }
            return;
        }
        let Some(state) = session.tcp_state() else {
            return;
        };
        if seg.is(TcpFlags::SYN) {
            if state == TcpState::SynReceived && !seg.is(TcpFlags::ACK) {
                trace!(flow = %session.key, "tcp_duplicate_syn");
                self.send_syn_ack(session);
            } else {
                self.send_ack(session);
            }
            return;
        }
        if !seg.is(TcpFlags::ACK) {
            trace!(flow = %session.key, flags = %seg.flags, "tcp_segment_without_ack");
            return;
        }

        let Some(tcp) = session.tcp.as_mut() else {
            return;
        };
        tcp.peer_window = seg.window;
        if let Some((value, _)) = seg.timestamp {
            tcp.peer_ts = Some(value);
        }
        if seq_lt(tcp.snd_una, seg.ack) && seq_le(seg.ack, tcp.snd_next) {
            tcp.snd_una = seg.ack;
        }
        let fin_acked = tcp.fin_sent && tcp.snd_una == tcp.snd_next;

        match state {
            TcpState::SynReceived => {
                if tcp.snd_una != tcp.snd_next {
                    trace!(flow = %session.key, ack = seg.ack, "tcp_handshake_ack_mismatch");
                    return;
                }
                tcp.state = TcpState::Established;
                debug!(flow = %session.key, "tcp_established");
            }
            TcpState::LastAck if fin_acked => {
                self.end_session(session_ref, session, "closed");
                return;
            }
            _ => {}
        }

        let accepted = match session.tcp.as_mut() {
            Some(tcp) => accept_segment(tcp, seg),
            None => return,
        };
        for chunk in accepted.chunks {
            self.send_upstream(session, chunk);
        }
        if accepted.ack {
            self.send_ack(session);
        }
        if accepted.fin && self.client_finished(session_ref, session) {
            return;
        }

        // The ACK may have opened the app's window.
        self.flush_to_device(session);
        self.maybe_send_fin(session);
    }

    /// The app's FIN arrived in order. Returns true when the session ended.
    fn client_finished(&self, session_ref: &SessionRef, session: &mut Session) -> bool {
        let Some(tcp) = session.tcp.as_mut() else {
            return false;
        };
        match tcp.state {
            TcpState::Established => {
                tcp.state = TcpState::CloseWait;
                if tcp.socks.as_ref().is_some_and(|hs| !hs.is_done()) {
                    tcp.shutdown_pending = true;
                } else if let Some(handle) = session.upstream {
                    self.mux.shutdown_write(handle);
                }
                debug!(flow = %session.key, "tcp_client_fin");
                false
            }
            TcpState::FinWait => {
                self.end_session(session_ref, session, "closed");
                true
            }
            _ => false,
        }
    }

    fn send_upstream(&self, session: &mut Session, data: Bytes) {
        let Some(handle) = session.upstream else {
            return;
        };
        if let Some(tcp) = session.tcp.as_mut() {
            if tcp.socks.as_ref().is_some_and(|hs| !hs.is_done()) {
                tcp.held_for_upstream.extend_from_slice(&data);
                return;
            }
        }
        self.mux.send(handle, data);
    }

    // ── Toward the app ───────────────────────────────────────────────────────

    fn advertised_mss(&self) -> u16 {
        let mss = self
            .config
            .mtu
            .saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN);
        u16::try_from(mss).unwrap_or(u16::MAX)
    }

    fn max_segment(&self, tcp: &TcpControl) -> usize {
        let ceiling = usize::from(self.advertised_mss()).max(1);
        usize::from(tcp.peer_mss.unwrap_or(DEFAULT_SEGMENT)).clamp(1, ceiling)
    }

    fn send_syn_ack(&self, session: &Session) {
        let Some(tcp) = session.tcp.as_ref() else {
            return;
        };
        let reply = TcpReply {
            seq: tcp.isn,
            ack: tcp.rcv_next,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: RECEIVE_WINDOW,
            mss: Some(self.advertised_mss()),
            timestamp: tcp.peer_ts.map(|echo| (ts_value(session), echo)),
            payload: &[],
        };
        self.emit(
            &session.key,
            build_tcp(session.reply_src(), session.reply_dst(), &reply),
        );
    }

    fn send_segment(&self, session: &Session, seq: u32, flags: TcpFlags, payload: &[u8]) {
        let Some(tcp) = session.tcp.as_ref() else {
            return;
        };
        let reply = TcpReply {
            seq,
            ack: tcp.rcv_next,
            flags,
            window: RECEIVE_WINDOW,
            mss: None,
            timestamp: tcp.peer_ts.map(|echo| (ts_value(session), echo)),
            payload,
        };
        self.emit(
            &session.key,
            build_tcp(session.reply_src(), session.reply_dst(), &reply),
        );
    }

    fn send_ack(&self, session: &Session) {
        if let Some(seq) = session.tcp.as_ref().map(|tcp| tcp.snd_next) {
            self.send_segment(session, seq, TcpFlags::ACK, &[]);
        }
    }

    pub(super) fn reset_client(&self, session: &Session) {
        let Some(tcp) = session.tcp.as_ref() else {
            return;
        };
        if tcp.state == TcpState::Closed {
            return;
        }
        let reply = TcpReply::control(
            tcp.snd_next,
            tcp.rcv_next,
            TcpFlags::RST | TcpFlags::ACK,
            0,
        );
        self.emit(
            &session.key,
            build_tcp(session.reply_src(), session.reply_dst(), &reply),
        );
    }

    /// Segment pending upstream bytes into whatever window the app offers.
    fn flush_to_device(&self, session: &mut Session) {
        let Some(tcp) = session.tcp.as_ref() else {
            return;
        };
        if tcp.fin_sent || !matches!(tcp.state, TcpState::Established | TcpState::CloseWait) {
            return;
        }
        let segment = self.max_segment(tcp);

        while !session.to_device.is_empty() {
            let Some(tcp) = session.tcp.as_ref() else {
                return;
            };
            let room = u32::from(tcp.peer_window).saturating_sub(tcp.in_flight()) as usize;
            if room == 0 {
                break;
            }
            let seq = tcp.snd_next;
            let take = segment.min(room).min(session.to_device.len());
            let payload = session.to_device.split_to(take).freeze();
            let flags = if session.to_device.is_empty() {
                TcpFlags::ACK | TcpFlags::PSH
            } else {
                TcpFlags::ACK
            };
            self.send_segment(session, seq, flags, &payload);
            if let Some(tcp) = session.tcp.as_mut() {
                tcp.snd_next = tcp.snd_next.wrapping_add(take as u32);
            }
        }

        if session.read_paused && session.to_device.len() < RESUME_BELOW {
            if let Some(handle) = session.upstream {
                session.read_paused = false;
                self.mux.set_read_paused(handle, false);
            }
        }
    }

    /// FIN toward the app once upstream is done and everything is sent.
    fn maybe_send_fin(&self, session: &mut Session) {
        if !session.upstream_eof || !session.to_device.is_empty() {
            return;
        }
        let Some(tcp) = session.tcp.as_ref() else {
            return;
        };
        if tcp.fin_sent {
            return;
        }
        let next = match tcp.state {
            TcpState::Established => TcpState::FinWait,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return,
        };
        let seq = tcp.snd_next;
        self.send_segment(session, seq, TcpFlags::ACK | TcpFlags::FIN, &[]);
        if let Some(tcp) = session.tcp.as_mut() {
            tcp.snd_next = tcp.snd_next.wrapping_add(1);
            tcp.fin_sent = true;
            tcp.state = next;
        }
        debug!(flow = %session.key, state = ?next, "tcp_fin_sent");
    }

    // ── Reactor callbacks ────────────────────────────────────────────────────

    pub(super) fn tcp_upstream_connected(&self, handle: UpstreamHandle, key: &FlowKey) {
        self.with_session(handle, key, |_, session| {
            session.upstream_connected = true;
            trace!(flow = %key, handle = %handle, "tcp_upstream_connected");
        });
    }

    pub(super) fn tcp_upstream_data(
        &self,
        handle: UpstreamHandle,
        key: &FlowKey,
        data: &[u8],
    ) -> ReadControl {
        self.with_session(handle, key, |session_ref, session| {
            session.touch();
            let mut data = Bytes::copy_from_slice(data);

            if let Some(tcp) = session.tcp.as_mut() {
                if let Some(handshake) = tcp.socks.as_mut().filter(|hs| !hs.is_done()) {
                    match handshake.feed(&data) {
                        Ok(HandshakeOutput::NeedMore) => return ReadControl::Continue,
                        Ok(HandshakeOutput::Send(request)) => {
                            self.mux.send(handle, request);
                            return ReadControl::Continue;
                        }
                        Ok(HandshakeOutput::Established { leftover }) => {
                            let held = std::mem::take(&mut tcp.held_for_upstream).freeze();
                            self.mux.send(handle, held);
                            if tcp.shutdown_pending {
                                self.mux.shutdown_write(handle);
                            }
                            debug!(flow = %key, "socks_connected");
                            data = leftover;
                        }
                        Err(e) => {
                            warn!(flow = %key, error = %e, "socks_handshake_failed");
                            self.reset_client(session);
                            self.end_session(session_ref, session, "socks_failed");
                            return ReadControl::Continue;
                        }
                    }
                }
            }

            session.to_device.extend_from_slice(&data);
            self.flush_to_device(session);
            if session.to_device.len() > PAUSE_ABOVE {
                session.read_paused = true;
                trace!(flow = %key, pending = session.to_device.len(), "tcp_upstream_paused");
                ReadControl::Pause
            } else {
                ReadControl::Continue
            }
        })
        .unwrap_or(ReadControl::Continue)
    }

    pub(super) fn tcp_upstream_eof(&self, handle: UpstreamHandle, key: &FlowKey) {
        self.with_session(handle, key, |session_ref, session| {
            let socks_pending = session
                .tcp
                .as_ref()
                .and_then(|tcp| tcp.socks.as_ref())
                .is_some_and(|hs| !hs.is_done());
            if socks_pending {
                warn!(flow = %key, "socks_closed_during_handshake");
                self.reset_client(session);
                self.end_session(session_ref, session, "proxy_closed");
                return;
            }
            session.upstream_eof = true;
            debug!(flow = %key, pending = session.to_device.len(), "tcp_upstream_eof");
            self.maybe_send_fin(session);
        });
    }

    pub(super) fn tcp_upstream_failed(
        &self,
        handle: UpstreamHandle,
        key: &FlowKey,
        error: UpstreamError,
    ) {
        self.with_session(handle, key, |session_ref, session| {
            debug!(flow = %key, error = %error, "tcp_upstream_failed");
            self.reset_client(session);
            self.end_session(session_ref, session, "upstream_failed");
        });
    }
}
