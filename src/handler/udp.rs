use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::SessionHandler;
use crate::mux::{ReadControl, UpstreamError, UpstreamHandle};
use crate::packet::builder::build_udp;
use crate::packet::{Ipv4Info, UdpDatagram};
use crate::session::{FlowKey, Protocol};

impl SessionHandler {
    /// UDP has no handshake: the first datagram opens the session and it
    /// lives until idle eviction or an upstream error.
    pub(super) fn handle_udp(&self, ip: &Ipv4Info, datagram: &UdpDatagram<'_>) {
        let key = FlowKey::new(
            Protocol::Udp,
            SocketAddrV4::new(ip.src, datagram.src_port),
            SocketAddrV4::new(ip.dst, datagram.dst_port),
        );
        let target = self.config.rule.target_for(Protocol::Udp, key.remote);
        let (session_ref, created) = match self
            .table
            .get_or_try_insert(key, || self.open_upstream(key, target, None))
        {
            Ok(found) => found,
            Err(e) => {
                warn!(flow = %key, error = %e, "udp_flow_dropped");
                return;
            }
        };

        let mut session = session_ref.lock();
        if session.closed {
            return;
        }
        if created {
            debug!(flow = %key, "udp_session_opened");
        }
        session.touch();
        trace!(flow = %key, len = datagram.payload.len(), "udp_out");
        if let Some(handle) = session.upstream {
            self.mux
                .send(handle, Bytes::copy_from_slice(datagram.payload));
        }
    }

    pub(super) fn udp_upstream_data(
        &self,
        handle: UpstreamHandle,
        key: &FlowKey,
        data: &[u8],
    ) -> ReadControl {
        self.with_session(handle, key, |_, session| {
            session.touch();
            trace!(flow = %key, len = data.len(), "udp_in");
            self.emit(
                key,
                build_udp(session.reply_src(), session.reply_dst(), data),
            );
        });
        ReadControl::Continue
    }

    pub(super) fn udp_upstream_failed(
        &self,
        handle: UpstreamHandle,
        key: &FlowKey,
        error: UpstreamError,
    ) {
        self.with_session(handle, key, |session_ref, session| {
            debug!(flow = %key, error = %error, "udp_upstream_failed");
            self.end_session(session_ref, session, "upstream_failed");
        });
    }
}
