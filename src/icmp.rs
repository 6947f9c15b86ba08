//! Echo replies for pings sent into the tunnel.
//!
//! We can't forward raw ICMP without privileges, so each echo request is
//! answered locally once the destination is confirmed reachable.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use crate::packet::builder::build_icmp_echo_reply;
use crate::packet::IcmpEcho;
use crate::writer::PacketQueue;

pub const MAX_CONCURRENT_PROBES: usize = 20;
pub const PROBE_BUDGET: Duration = Duration::from_secs(10);
/// Port used for the TCP fallback probe; any answer at all means reachable.
const ECHO_PORT: u16 = 7;

pub struct IcmpResponder {
    runtime: Option<Runtime>,
    limit: Arc<Semaphore>,
    out: Arc<PacketQueue>,
    budget: Duration,
}

impl std::fmt::Debug for IcmpResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcmpResponder")
            .field("available", &self.limit.available_permits())
            .field("budget", &self.budget)
            .finish()
    }
}

impl IcmpResponder {
    pub fn new(out: Arc<PacketQueue>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tunsnare-icmp")
            .enable_all()
            .build()?;
        Ok(IcmpResponder {
            runtime: Some(runtime),
            limit: Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES)),
            out,
            budget: PROBE_BUDGET,
        })
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Queue a probe for `echo` sent from `src` to `dst`. Returns false when
    /// the pool is saturated and the request was dropped.
    pub fn submit(&self, src: Ipv4Addr, dst: Ipv4Addr, echo: &IcmpEcho<'_>) -> bool {
        let Some(runtime) = self.runtime.as_ref() else {
            return false;
        };
        let Ok(permit) = Arc::clone(&self.limit).try_acquire_owned() else {
            debug!(dst = %dst, "icmp_pool_full");
            return false;
        };
        let out = Arc::clone(&self.out);
        let budget = self.budget;
        let (id, seq) = (echo.id, echo.seq);
        let payload = Bytes::copy_from_slice(echo.payload);

        runtime.spawn(async move {
            let _permit = permit;
            if !is_reachable(dst, budget).await {
                debug!(dst = %dst, "icmp_target_unreachable");
                return;
            }
            match build_icmp_echo_reply(dst, src, id, seq, &payload) {
                Ok(reply) => {
                    trace!(dst = %dst, id, seq, "icmp_echo_reply");
                    out.push(reply);
                }
                Err(e) => warn!(dst = %dst, error = %e, "icmp_reply_build_failed"),
            }
        });
        true
    }
}

impl Drop for IcmpResponder {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn is_reachable(dst: Ipv4Addr, budget: Duration) -> bool {
    let started = tokio::time::Instant::now();
    if ping_once(dst, budget).await {
        return true;
    }
    let remaining = budget.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return false;
    }
    tcp_probe(dst, remaining).await
}

async fn ping_once(dst: Ipv4Addr, budget: Duration) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    {
        let mut cmd = Command::new("ping");
        cmd.arg("-n").arg("-c").arg("1");

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let timeout_secs = ((budget.as_millis().saturating_add(999)) / 1000).max(1);
            cmd.arg("-w").arg(timeout_secs.to_string());
        }

        #[cfg(target_os = "macos")]
        {
            let timeout_ms = budget.as_millis().max(1);
            cmd.arg("-W").arg(timeout_ms.to_string());
        }

        cmd.arg(dst.to_string()).kill_on_drop(true);

        match tokio::time::timeout(budget, cmd.output()).await {
            Ok(Ok(output)) => output.status.success(),
            _ => false,
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        let _ = (dst, budget);
        false
    }
}

async fn tcp_probe(dst: Ipv4Addr, budget: Duration) -> bool {
    let addr = SocketAddr::from((dst, ECHO_PORT));
    match tokio::time::timeout(budget, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(err)) => is_reachable_connect_error(&err),
        Err(_) => false,
    }
}

fn is_reachable_connect_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse, Transport};

    #[test]
    fn test_loopback_ping_is_answered_with_flipped_addresses() {
        let out = Arc::new(PacketQueue::new());
        let responder = IcmpResponder::new(Arc::clone(&out))
            .expect("responder")
            .with_budget(Duration::from_secs(3));
        let echo = IcmpEcho {
            id: 42,
            seq: 7,
            payload: b"abcdefgh",
        };
        assert!(responder.submit(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::LOCALHOST, &echo));

        let reply = out
            .pop_timeout(Duration::from_secs(5))
            .expect("echo reply queued");
        let packet = parse(&reply).expect("parse reply");
        assert_eq!(packet.ip.src, Ipv4Addr::LOCALHOST);
        assert_eq!(packet.ip.dst, Ipv4Addr::new(10, 0, 0, 2));
        // Replies are not requests, so the parser reports them as other ICMP.
        assert_eq!(packet.transport, Transport::IcmpOther(0));
    }

    #[test]
    fn test_saturated_pool_drops_requests() {
        let out = Arc::new(PacketQueue::new());
        let responder = IcmpResponder::new(out).expect("responder");
        let held: Vec<_> = (0..MAX_CONCURRENT_PROBES)
            .map(|_| {
                Arc::clone(&responder.limit)
                    .try_acquire_owned()
                    .expect("permit")
            })
            .collect();
        let echo = IcmpEcho {
            id: 1,
            seq: 1,
            payload: b"",
        };
        assert!(!responder.submit(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::LOCALHOST, &echo));
        drop(held);
    }

    #[test]
    fn test_refused_counts_as_reachable() {
        assert!(is_reachable_connect_error(&io::Error::from(
            ErrorKind::ConnectionRefused
        )));
        assert!(!is_reachable_connect_error(&io::Error::from(
            ErrorKind::TimedOut
        )));
    }
}
