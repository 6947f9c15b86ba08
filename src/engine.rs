//! Engine lifecycle: wires the tunnel, session handler, reactor and writer
//! together and reports what happens to an observer.

use std::fmt;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureMode, RedirectionRule, DEFAULT_REDIRECT_PORTS};
use crate::discovery::{ProxyCertificate, StoredProxy, ValidatedProxy};
use crate::handler::{HandlerConfig, SessionHandler};
use crate::icmp::IcmpResponder;
use crate::mux::{Multiplexer, NoopProtector, SocketProtector, UpstreamEvents};
use crate::session::table::IdleTimeouts;
use crate::writer::{self, PacketQueue, WriterStats};

pub const DEFAULT_MTU: usize = 1500;
const POLL_TIMEOUT_MS: u16 = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("tunnel descriptor unusable: {0}")]
    Tunnel(#[source] io::Error),

    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

// ── Trust and status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    /// Installed in the system store.
    System,
    /// Installed by the user.
    User,
    Untrusted,
    /// The host cannot tell.
    Unknown,
}

/// Looks up whether the proxy's CA is trusted on this device.
pub trait CertificateTrust: Send + Sync {
    fn trust_status(&self, certificate: &ProxyCertificate) -> TrustStatus;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownTrust;

impl CertificateTrust for UnknownTrust {
    fn trust_status(&self, _certificate: &ProxyCertificate) -> TrustStatus {
        TrustStatus::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Started {
        proxy: StoredProxy,
        trust: TrustStatus,
    },
    Stopped,
    Failed {
        reason: String,
    },
}

pub trait StatusObserver: Send + Sync {
    fn on_status(&self, event: StatusEvent);
}

/// Forwards status events into a channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    #[must_use]
    pub fn new() -> (Self, UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = unbounded_channel();
        (ChannelObserver { tx }, rx)
    }
}

impl StatusObserver for ChannelObserver {
    fn on_status(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            debug!("status_receiver_gone");
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EngineConfig {
    pub proxy: ValidatedProxy,
    pub redirect_ports: Vec<u16>,
    pub capture_mode: CaptureMode,
    pub mtu: usize,
    pub timeouts: IdleTimeouts,
    pub answer_pings: bool,
    pub protector: Arc<dyn SocketProtector>,
    pub trust: Arc<dyn CertificateTrust>,
}

impl EngineConfig {
    #[must_use]
    pub fn new(proxy: ValidatedProxy) -> Self {
        EngineConfig {
            proxy,
            redirect_ports: DEFAULT_REDIRECT_PORTS.to_vec(),
            capture_mode: CaptureMode::default(),
            mtu: DEFAULT_MTU,
            timeouts: IdleTimeouts::default(),
            answer_pings: true,
            protector: Arc::new(NoopProtector),
            trust: Arc::new(UnknownTrust),
        }
    }

    fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            rule: RedirectionRule::new(self.proxy.addr(), self.redirect_ports.iter().copied()),
            capture: self.capture_mode,
            mtu: self.mtu,
            timeouts: self.timeouts,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("proxy", &self.proxy.addr())
            .field("redirect_ports", &self.redirect_ports)
            .field("capture_mode", &self.capture_mode)
            .field("mtu", &self.mtu)
            .field("timeouts", &self.timeouts)
            .field("answer_pings", &self.answer_pings)
            .finish_non_exhaustive()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// State shared by the engine threads of one run.
struct Lifecycle {
    stopping: AtomicBool,
    failed: AtomicBool,
    queue: Arc<PacketQueue>,
    mux: Multiplexer,
    observer: Arc<dyn StatusObserver>,
}

impl Lifecycle {
    /// Report a fatal tunnel error once. Errors seen while already stopping
    /// are expected and not reported.
    fn fail(&self, reason: String) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            debug!(reason = %reason, "engine_error_during_stop");
            return;
        }
        self.failed.store(true, Ordering::Release);
        error!(reason = %reason, "engine_failed");
        self.queue.close();
        self.mux.stop();
        self.observer.on_status(StatusEvent::Failed { reason });
    }
}

struct Running {
    life: Arc<Lifecycle>,
    handler: Arc<SessionHandler>,
    stats: Arc<WriterStats>,
    ingest: JoinHandle<()>,
    writer: JoinHandle<()>,
    reactor: JoinHandle<()>,
}

/// One interception engine. Construct it once and hand it to whoever needs
/// to control or query it.
pub struct Engine {
    config: EngineConfig,
    observer: Arc<dyn StatusObserver>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, observer: Arc<dyn StatusObserver>) -> Self {
        Engine {
            config,
            observer,
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True while a run is active and has not failed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|run| !run.life.stopping.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map_or(0, |run| run.handler.active_sessions())
    }

    /// Start intercepting packets on `tunnel`. The engine owns the descriptor
    /// from here on and closes it on stop.
    pub fn start(&self, tunnel: OwnedFd) -> Result<(), EngineError> {
        let mut slot = self.running.lock();
        if let Some(run) = slot.as_ref() {
            if !run.life.stopping.load(Ordering::Acquire) {
                return Err(EngineError::AlreadyRunning);
            }
        }
        // A run that failed on its own still has threads to reap.
        if let Some(stale) = slot.take() {
            self.finish(stale);
        }

        let write_fd = tunnel.try_clone().map_err(EngineError::Tunnel)?;
        let reader = File::from(tunnel);
        let tunnel_writer = File::from(write_fd);

        let queue = Arc::new(PacketQueue::new());
        let (mux, reactor) =
            Multiplexer::new(Arc::clone(&self.config.protector)).map_err(|source| {
                EngineError::Spawn {
                    what: "upstream reactor",
                    source,
                }
            })?;

        let mut handler =
            SessionHandler::new(self.config.handler_config(), mux.clone(), Arc::clone(&queue));
        if self.config.answer_pings {
            match IcmpResponder::new(Arc::clone(&queue)) {
                Ok(icmp) => handler = handler.with_icmp(icmp),
                Err(e) => warn!(error = ?e.to_string(), "icmp_responder_unavailable"),
            }
        }
        let handler = Arc::new(handler);

        let life = Arc::new(Lifecycle {
            stopping: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            queue: Arc::clone(&queue),
            mux: mux.clone(),
            observer: Arc::clone(&self.observer),
        });

        let events: Arc<dyn UpstreamEvents> = handler.clone();
        let reactor = reactor.spawn(events).map_err(|source| EngineError::Spawn {
            what: "upstream reactor",
            source,
        })?;

        let stats = Arc::new(WriterStats::default());
        let writer_life = Arc::clone(&life);
        let writer = match writer::spawn(tunnel_writer, queue, Arc::clone(&stats), move |e| {
            writer_life.fail(format!("tunnel write failed: {e}"));
        }) {
            Ok(join) => join,
            Err(source) => {
                mux.stop();
                let _ = reactor.join();
                return Err(EngineError::Spawn {
                    what: "packet writer",
                    source,
                });
            }
        };

        let ingest_handler = Arc::clone(&handler);
        let ingest_life = Arc::clone(&life);
        let mtu = self.config.mtu;
        let ingest = match std::thread::Builder::new()
            .name("tunsnare-ingest".to_string())
            .spawn(move || ingest_loop(reader, &ingest_handler, &ingest_life, mtu))
        {
            Ok(join) => join,
            Err(source) => {
                life.stopping.store(true, Ordering::Release);
                life.queue.close();
                mux.stop();
                let _ = writer.join();
                let _ = reactor.join();
                return Err(EngineError::Spawn {
                    what: "ingest loop",
                    source,
                });
            }
        };

        let trust = self.config.trust.trust_status(self.config.proxy.certificate());
        if trust == TrustStatus::Untrusted {
            warn!(
                subject = self.config.proxy.certificate().subject(),
                "proxy_certificate_untrusted"
            );
        }
        info!(
            proxy = %self.config.proxy.addr(),
            capture_mode = ?self.config.capture_mode,
            ports = ?self.config.redirect_ports,
            mtu,
            trust = ?trust,
            "engine_started"
        );

        *slot = Some(Running {
            life,
            handler,
            stats,
            ingest,
            writer,
            reactor,
        });
        drop(slot);

        self.observer.on_status(StatusEvent::Started {
            proxy: self.config.proxy.to_stored(),
            trust,
        });
        Ok(())
    }

    /// Stop the current run. Safe to call repeatedly or before any start.
    pub fn stop(&self) {
        let Some(run) = self.running.lock().take() else {
            debug!("engine_not_running");
            return;
        };
        let failed = run.life.failed.load(Ordering::Acquire);
        self.finish(run);
        if !failed {
            self.observer.on_status(StatusEvent::Stopped);
        }
    }

    pub fn restart(&self, tunnel: OwnedFd) -> Result<(), EngineError> {
        self.stop();
        self.start(tunnel)
    }

    fn finish(&self, run: Running) {
        let Running {
            life,
            handler,
            stats,
            ingest,
            writer,
            reactor,
        } = run;

        life.stopping.store(true, Ordering::Release);
        if ingest.join().is_err() {
            warn!("ingest_thread_panicked");
        }
        // Sockets close while the reactor still runs; queued replies are
        // written best effort before the writer exits.
        handler.shutdown_all();
        life.queue.close();
        if writer.join().is_err() {
            warn!("writer_thread_panicked");
        }
        life.mux.stop();
        if reactor.join().is_err() {
            warn!("reactor_thread_panicked");
        }
        info!(
            written = stats.written.load(Ordering::Relaxed),
            dropped = stats.dropped.load(Ordering::Relaxed),
            failed = life.failed.load(Ordering::Acquire),
            "engine_stopped"
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(run) = self.running.get_mut().take() {
            self.finish(run);
        }
    }
}

fn ingest_loop(mut tunnel: File, handler: &SessionHandler, life: &Lifecycle, mtu: usize) {
    let mut buf = vec![0u8; mtu.max(DEFAULT_MTU)];
    let mut last_sweep = Instant::now();
    info!("ingest_started");

    while !life.stopping.load(Ordering::Acquire) {
        match wait_readable(&tunnel) {
            Ok(true) => match tunnel.read(&mut buf) {
                Ok(0) => {
                    life.fail("tunnel closed".to_string());
                    break;
                }
                Ok(n) => handler.handle_packet(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => {
                    life.fail(format!("tunnel read failed: {e}"));
                    break;
                }
            },
            Ok(false) => {}
            Err(e) => {
                life.fail(format!("tunnel poll failed: {e}"));
                break;
            }
        }

        let now = Instant::now();
        if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
            handler.sweep_idle(now);
            last_sweep = now;
        }
    }
    info!("ingest_stopped");
}

/// Wait up to the poll timeout for a packet. Errors mean the tunnel is gone.
fn wait_readable(tunnel: &File) -> io::Result<bool> {
    let mut fds = [PollFd::new(tunnel.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => {
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLNVAL) {
                return Err(io::Error::from_raw_os_error(Errno::EBADF as i32));
            }
            Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
        }
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::certificate::fixtures::{TEST_CA_FINGERPRINT, TEST_CA_PEM};
    use crate::discovery::ProxyInfo;
    use crate::packet::builder::{build_tcp, TcpReply};
    use crate::packet::{parse, TcpFlags, Transport};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::os::unix::net::UnixDatagram;

    struct UserTrust;

    impl CertificateTrust for UserTrust {
        fn trust_status(&self, _certificate: &ProxyCertificate) -> TrustStatus {
            TrustStatus::User
        }
    }

    fn proxy_at(port: u16) -> ValidatedProxy {
        let stored = StoredProxy {
            ip: Ipv4Addr::LOCALHOST.into(),
            port,
            certificate: TEST_CA_PEM.to_string(),
        };
        let link = ProxyInfo {
            addresses: vec![stored.ip.to_string()],
            port,
            local_tunnel_port: None,
            cert_fingerprint: TEST_CA_FINGERPRINT.to_string(),
        };
        ValidatedProxy::restore(&stored, &link).expect("restore proxy")
    }

    #[test]
    fn test_syn_through_tunnel_gets_syn_ack_and_reaches_proxy() {
        let proxy = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
        let proxy_port = proxy.local_addr().expect("addr").port();

        let mut config = EngineConfig::new(proxy_at(proxy_port));
        config.redirect_ports = vec![443];
        config.answer_pings = false;
        config.trust = Arc::new(UserTrust);
        let (observer, mut events) = ChannelObserver::new();
        let engine = Engine::new(config, Arc::new(observer));

        let (app_side, engine_side) = UnixDatagram::pair().expect("socket pair");
        app_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        engine.start(OwnedFd::from(engine_side)).expect("start");
        assert!(engine.is_running());
        match events.try_recv().expect("started event") {
            StatusEvent::Started { proxy, trust } => {
                assert_eq!(proxy.port, proxy_port);
                assert_eq!(trust, TrustStatus::User);
            }
            other => panic!("unexpected {other:?}"),
        }

        let client = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000);
        let server = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443);
        let syn = build_tcp(client, server, &TcpReply::control(1000, 0, TcpFlags::SYN, 65535))
            .expect("syn");
        app_side.send(&syn).expect("send syn");

        let mut buf = [0u8; 2048];
        let n = app_side.recv(&mut buf).expect("syn-ack");
        let packet = parse(&buf[..n]).expect("parse");
        assert_eq!(packet.source(), Some(server));
        let Transport::Tcp(seg) = packet.transport else {
            panic!("expected tcp");
        };
        assert!(seg.is(TcpFlags::SYN) && seg.is(TcpFlags::ACK));
        assert_eq!(seg.ack, 1001);

        let (_upstream, _) = proxy.accept().expect("redirected connection");
        assert_eq!(engine.active_sessions(), 1);

        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.active_sessions(), 0);
        assert_eq!(events.try_recv().expect("stopped"), StatusEvent::Stopped);

        engine.stop();
        assert!(events.try_recv().is_err(), "second stop is silent");
    }

    #[test]
    fn test_stop_without_start_is_harmless() {
        let (observer, mut events) = ChannelObserver::new();
        let engine = Engine::new(EngineConfig::new(proxy_at(8000)), Arc::new(observer));
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_second_start_is_rejected_and_restart_works() {
        let mut config = EngineConfig::new(proxy_at(8000));
        config.answer_pings = false;
        let (observer, mut events) = ChannelObserver::new();
        let engine = Engine::new(config, Arc::new(observer));

        let (_app, first) = UnixDatagram::pair().expect("pair");
        engine.start(OwnedFd::from(first)).expect("start");
        let (app2, second) = UnixDatagram::pair().expect("pair");
        assert!(matches!(
            engine.start(OwnedFd::from(second)),
            Err(EngineError::AlreadyRunning)
        ));
        // A rejected tunnel is closed, not leaked.
        assert!(app2.send(b"x").is_err());

        let (_app3, third) = UnixDatagram::pair().expect("pair");
        engine.restart(OwnedFd::from(third)).expect("restart");
        assert!(engine.is_running());

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(matches!(
            seen.as_slice(),
            [StatusEvent::Started { .. }, StatusEvent::Stopped, StatusEvent::Started { .. }]
        ));
        engine.stop();
    }

    #[test]
    fn test_status_events_serialize_with_tag() {
        let json = serde_json::to_value(StatusEvent::Failed {
            reason: "tunnel closed".into(),
        })
        .expect("json");
        assert_eq!(
            json,
            serde_json::json!({ "event": "failed", "reason": "tunnel closed" })
        );
    }
}
