//! Upstream socket multiplexer.
//!
//! One reactor thread owns every upstream socket behind a single mio `Poll`.
//! Callers talk to it through [`Multiplexer`], which only queues commands and
//! wakes the reactor; all socket I/O happens on the reactor thread, and all
//! outcomes (connected, data, EOF, failures) come back through
//! [`UpstreamEvents`]. The reactor never touches session state.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Buf, Bytes};
use crossbeam_queue::SegQueue;
use mio::event::Event;
use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use nix::errno::Errno;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::session::{FlowKey, Protocol};

const WAKE_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const READ_BUF: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamHandle(usize);

impl fmt::Display for UpstreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),

    #[error("host refused to protect socket for {0}")]
    Protect(SocketAddr),

    #[error("multiplexer is stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(io::Error),

    #[error("read failed: {0}")]
    Read(io::Error),

    #[error("write failed: {0}")]
    Write(io::Error),
}

/// Whether the reactor should keep reading a socket after delivering data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadControl {
    Continue,
    Pause,
}

/// Keeps upstream sockets from being routed back into the tunnel.
pub trait SocketProtector: Send + Sync {
    /// Returns false when the host refused; the socket is then discarded.
    fn protect(&self, fd: BorrowedFd<'_>) -> bool;
}

/// For hosts that route upstream traffic around the tunnel on their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: BorrowedFd<'_>) -> bool {
        true
    }
}

/// Tags sockets with `SO_MARK` so a policy route can exclude them.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy)]
pub struct FwmarkProtector {
    mark: u32,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl FwmarkProtector {
    #[must_use]
    pub fn new(mark: u32) -> Self {
        FwmarkProtector { mark }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl SocketProtector for FwmarkProtector {
    fn protect(&self, fd: BorrowedFd<'_>) -> bool {
        match nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::Mark, &self.mark) {
            Ok(()) => true,
            Err(e) => {
                warn!(mark = self.mark, error = ?e.to_string(), "socket_mark_failed");
                false
            }
        }
    }
}

/// Reactor callbacks, invoked on the reactor thread.
pub trait UpstreamEvents: Send + Sync {
    fn on_connected(&self, handle: UpstreamHandle, key: &FlowKey);
    fn on_data(&self, handle: UpstreamHandle, key: &FlowKey, data: &[u8]) -> ReadControl;
    /// The remote side finished sending (TCP only).
    fn on_eof(&self, handle: UpstreamHandle, key: &FlowKey);
    /// The socket is already gone when this fires.
    fn on_error(&self, handle: UpstreamHandle, key: &FlowKey, error: UpstreamError);
}

// ── Commands ─────────────────────────────────────────────────────────────────

enum UpstreamSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

enum Command {
    Register {
        handle: UpstreamHandle,
        key: FlowKey,
        socket: UpstreamSocket,
    },
    Send {
        handle: UpstreamHandle,
        data: Bytes,
    },
    ShutdownWrite(UpstreamHandle),
    PauseRead(UpstreamHandle, bool),
    Close(UpstreamHandle),
}

struct Shared {
    commands: SegQueue<Command>,
    waker: Waker,
    running: AtomicBool,
    next_handle: AtomicUsize,
    protector: Arc<dyn SocketProtector>,
}

/// Cheap, cloneable front end to the reactor.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("running", &self.is_running())
            .field("pending_commands", &self.shared.commands.len())
            .finish()
    }
}

impl Multiplexer {
    /// Build the front end and the reactor that must be spawned to serve it.
    pub fn new(protector: Arc<dyn SocketProtector>) -> io::Result<(Multiplexer, Reactor)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(Shared {
            commands: SegQueue::new(),
            waker,
            running: AtomicBool::new(true),
            next_handle: AtomicUsize::new(1),
            protector,
        });
        Ok((
            Multiplexer {
                shared: Arc::clone(&shared),
            },
            Reactor { poll, shared },
        ))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Open a non-blocking socket for `key` toward `target`. TCP connects
    /// asynchronously; completion arrives as `on_connected` or `on_error`.
    pub fn register(&self, key: FlowKey, target: SocketAddr) -> Result<UpstreamHandle, MuxError> {
        if !self.is_running() {
            return Err(MuxError::Stopped);
        }
        let socket = match key.protocol {
            Protocol::Tcp => UpstreamSocket::Tcp(self.open_tcp(target)?),
            Protocol::Udp => UpstreamSocket::Udp(self.open_udp(target)?),
        };
        let handle = UpstreamHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        trace!(flow = %key, handle = %handle, target = %target, "upstream_register");
        self.push(Command::Register {
            handle,
            key,
            socket,
        });
        Ok(handle)
    }

    pub fn send(&self, handle: UpstreamHandle, data: Bytes) {
        if !data.is_empty() {
            self.push(Command::Send { handle, data });
        }
    }

    /// Half-close once everything queued so far has been written.
    pub fn shutdown_write(&self, handle: UpstreamHandle) {
        self.push(Command::ShutdownWrite(handle));
    }

    pub fn set_read_paused(&self, handle: UpstreamHandle, paused: bool) {
        self.push(Command::PauseRead(handle, paused));
    }

    /// Close and forget a socket. Unknown or already closed handles are ignored.
    pub fn close(&self, handle: UpstreamHandle) {
        self.push(Command::Close(handle));
    }

    /// Stop the reactor; every socket it owns is closed on the way out.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("mux_stop_requested");
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = ?e.to_string(), "mux_wake_failed");
        }
    }

    fn push(&self, command: Command) {
        if !self.is_running() {
            return;
        }
        self.shared.commands.push(command);
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = ?e.to_string(), "mux_wake_failed");
        }
    }

    fn new_socket(&self, target: SocketAddr, ty: Type) -> Result<Socket, MuxError> {
        let socket = Socket::new(Domain::for_address(target), ty, None)?;
        if !self.shared.protector.protect(socket.as_fd()) {
            return Err(MuxError::Protect(target));
        }
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn open_tcp(&self, target: SocketAddr) -> Result<TcpStream, MuxError> {
        let socket = self.new_socket(target, Type::STREAM)?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        match socket.connect(&target.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(Errno::EINPROGRESS as i32) => {}
            Err(e) => return Err(MuxError::Socket(e)),
        }
        Ok(TcpStream::from_std(socket.into()))
    }

    fn open_udp(&self, target: SocketAddr) -> Result<UdpSocket, MuxError> {
        let socket = self.new_socket(target, Type::DGRAM)?;
        socket.connect(&target.into())?;
        Ok(UdpSocket::from_std(socket.into()))
    }
}

// ── Reactor ──────────────────────────────────────────────────────────────────

struct Upstream {
    key: FlowKey,
    socket: UpstreamSocket,
    connected: bool,
    pending: VecDeque<Bytes>,
    shutdown_requested: bool,
    write_shut: bool,
    read_paused: bool,
    read_closed: bool,
}

enum Disposition {
    Keep,
    Drop(UpstreamError),
}

impl Upstream {
    fn new(key: FlowKey, socket: UpstreamSocket) -> Self {
        // Connected UDP sockets are usable immediately.
        let connected = matches!(socket, UpstreamSocket::Udp(_));
        Upstream {
            key,
            socket,
            connected,
            pending: VecDeque::new(),
            shutdown_requested: false,
            write_shut: false,
            read_paused: false,
            read_closed: false,
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        match &mut self.socket {
            UpstreamSocket::Tcp(stream) => registry.register(stream, token, interest),
            UpstreamSocket::Udp(socket) => registry.register(socket, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) {
        let result = match &mut self.socket {
            UpstreamSocket::Tcp(stream) => registry.deregister(stream),
            UpstreamSocket::Udp(socket) => registry.deregister(socket),
        };
        if let Err(e) = result {
            trace!(flow = %self.key, error = ?e.to_string(), "mux_deregister_failed");
        }
    }

    /// Resolve a pending non-blocking connect.
    fn check_connected(&mut self) -> io::Result<bool> {
        let UpstreamSocket::Tcp(stream) = &self.socket else {
            return Ok(true);
        };
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.socket {
            UpstreamSocket::Tcp(stream) => stream.read(buf),
            UpstreamSocket::Udp(socket) => socket.recv(buf),
        }
    }

    fn drain_reads(
        &mut self,
        handle: UpstreamHandle,
        events: &dyn UpstreamEvents,
        buf: &mut [u8],
    ) -> Disposition {
        while self.connected && !self.read_paused && !self.read_closed {
            match self.read_into(buf) {
                Ok(0) => {
                    if let UpstreamSocket::Tcp(_) = self.socket {
                        self.read_closed = true;
                        events.on_eof(handle, &self.key);
                    }
                }
                Ok(n) => {
                    if events.on_data(handle, &self.key, &buf[..n]) == ReadControl::Pause {
                        self.read_paused = true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Disposition::Drop(UpstreamError::Read(e)),
            }
        }
        Disposition::Keep
    }

    fn flush_writes(&mut self) -> Disposition {
        if !self.connected {
            return Disposition::Keep;
        }
        while let Some(front) = self.pending.front_mut() {
            let result = match &mut self.socket {
                UpstreamSocket::Tcp(stream) => stream.write(&front[..]),
                UpstreamSocket::Udp(socket) => socket.send(&front[..]),
            };
            match result {
                Ok(0) => {
                    return Disposition::Drop(UpstreamError::Write(ErrorKind::WriteZero.into()));
                }
                Ok(n) if n >= front.len() => {
                    self.pending.pop_front();
                }
                Ok(n) => front.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Disposition::Keep,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Disposition::Drop(UpstreamError::Write(e)),
            }
        }
        if self.shutdown_requested && !self.write_shut {
            if let UpstreamSocket::Tcp(stream) = &self.socket {
                if let Err(e) = stream.shutdown(Shutdown::Write) {
                    trace!(flow = %self.key, error = ?e.to_string(), "upstream_shutdown_failed");
                }
            }
            self.write_shut = true;
        }
        Disposition::Keep
    }

    fn on_ready(
        &mut self,
        handle: UpstreamHandle,
        event: &Event,
        events: &dyn UpstreamEvents,
        buf: &mut [u8],
    ) -> Disposition {
        if !self.connected {
            if !(event.is_writable() || event.is_error() || event.is_write_closed()) {
                return Disposition::Keep;
            }
            match self.check_connected() {
                Ok(true) => {
                    self.connected = true;
                    events.on_connected(handle, &self.key);
                }
                Ok(false) => return Disposition::Keep,
                Err(e) => return Disposition::Drop(UpstreamError::Connect(e)),
            }
        } else if event.is_error() {
            if let UpstreamSocket::Tcp(stream) = &self.socket {
                if let Ok(Some(e)) = stream.take_error() {
                    return Disposition::Drop(UpstreamError::Read(e));
                }
            }
        }

        if let Disposition::Drop(e) = self.flush_writes() {
            return Disposition::Drop(e);
        }
        self.drain_reads(handle, events, buf)
    }
}

/// The reactor half; consumed by [`Reactor::spawn`].
pub struct Reactor {
    poll: Poll,
    shared: Arc<Shared>,
}

impl Reactor {
    pub fn spawn(self, events: Arc<dyn UpstreamEvents>) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("tunsnare-mux".to_string())
            .spawn(move || self.run(events.as_ref()))
    }

    fn run(mut self, events: &dyn UpstreamEvents) {
        let mut sockets: HashMap<Token, Upstream> = HashMap::new();
        let mut ready = Events::with_capacity(EVENTS_CAPACITY);
        let mut buf = vec![0u8; READ_BUF];
        info!("mux_started");

        while self.shared.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut ready, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = ?e.to_string(), "mux_poll_failed");
                break;
            }
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }

            self.apply_commands(&mut sockets, events, &mut buf);

            for event in ready.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let Some(upstream) = sockets.get_mut(&token) else {
                    continue;
                };
                let handle = UpstreamHandle(token.0);
                if let Disposition::Drop(err) = upstream.on_ready(handle, event, events, &mut buf) {
                    self.drop_socket(&mut sockets, token, events, err);
                }
            }
        }

        let open = sockets.len();
        for (_, mut upstream) in sockets.drain() {
            upstream.deregister(self.poll.registry());
        }
        // Commands that raced with shutdown still own sockets; dropping closes them.
        while self.shared.commands.pop().is_some() {}
        info!(closed_sockets = open, "mux_stopped");
    }

    fn drop_socket(
        &self,
        sockets: &mut HashMap<Token, Upstream>,
        token: Token,
        events: &dyn UpstreamEvents,
        err: UpstreamError,
    ) {
        if let Some(mut upstream) = sockets.remove(&token) {
            upstream.deregister(self.poll.registry());
            debug!(flow = %upstream.key, error = %err, "upstream_failed");
            events.on_error(UpstreamHandle(token.0), &upstream.key, err);
        }
    }

    fn apply_commands(
        &self,
        sockets: &mut HashMap<Token, Upstream>,
        events: &dyn UpstreamEvents,
        buf: &mut [u8],
    ) {
        while let Some(command) = self.shared.commands.pop() {
            match command {
                Command::Register {
                    handle,
                    key,
                    socket,
                } => {
                    let token = Token(handle.0);
                    let mut upstream = Upstream::new(key, socket);
                    match upstream.register(self.poll.registry(), token) {
                        Ok(()) => {
                            sockets.insert(token, upstream);
                        }
                        Err(e) => {
                            warn!(flow = %key, error = ?e.to_string(), "mux_register_failed");
                            events.on_error(handle, &key, UpstreamError::Connect(e));
                        }
                    }
                }
                Command::Send { handle, data } => {
                    let token = Token(handle.0);
                    let Some(upstream) = sockets.get_mut(&token) else {
                        continue;
                    };
                    upstream.pending.push_back(data);
                    if let Disposition::Drop(err) = upstream.flush_writes() {
                        self.drop_socket(sockets, token, events, err);
                    }
                }
                Command::ShutdownWrite(handle) => {
                    let token = Token(handle.0);
                    let Some(upstream) = sockets.get_mut(&token) else {
                        continue;
                    };
                    upstream.shutdown_requested = true;
                    if let Disposition::Drop(err) = upstream.flush_writes() {
                        self.drop_socket(sockets, token, events, err);
                    }
                }
                Command::PauseRead(handle, paused) => {
                    let token = Token(handle.0);
                    let Some(upstream) = sockets.get_mut(&token) else {
                        continue;
                    };
                    upstream.read_paused = paused;
                    // Edge-triggered: anything that arrived while paused must be drained now.
                    if !paused {
                        if let Disposition::Drop(err) = upstream.drain_reads(handle, events, buf) {
                            self.drop_socket(sockets, token, events, err);
                        }
                    }
                }
                Command::Close(handle) => {
                    if let Some(mut upstream) = sockets.remove(&Token(handle.0)) {
                        upstream.deregister(self.poll.registry());
                        trace!(flow = %upstream.key, handle = %handle, "upstream_closed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::{Read as _, Write as _};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::sync::mpsc;

    #[derive(Debug, PartialEq, Eq)]
    enum Seen {
        Connected,
        Data(Vec<u8>),
        Eof,
        Error,
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<(UpstreamHandle, Seen)>>,
    }

    impl UpstreamEvents for Recorder {
        fn on_connected(&self, handle: UpstreamHandle, _key: &FlowKey) {
            let _ = self.tx.lock().send((handle, Seen::Connected));
        }
        fn on_data(&self, handle: UpstreamHandle, _key: &FlowKey, data: &[u8]) -> ReadControl {
            let _ = self.tx.lock().send((handle, Seen::Data(data.to_vec())));
            ReadControl::Continue
        }
        fn on_eof(&self, handle: UpstreamHandle, _key: &FlowKey) {
            let _ = self.tx.lock().send((handle, Seen::Eof));
        }
        fn on_error(&self, handle: UpstreamHandle, _key: &FlowKey, _error: UpstreamError) {
            let _ = self.tx.lock().send((handle, Seen::Error));
        }
    }

    fn start() -> (
        Multiplexer,
        JoinHandle<()>,
        mpsc::Receiver<(UpstreamHandle, Seen)>,
    ) {
        let (tx, rx) = mpsc::channel();
        let (mux, reactor) = Multiplexer::new(Arc::new(NoopProtector)).expect("mux");
        let join = reactor
            .spawn(Arc::new(Recorder { tx: Mutex::new(tx) }))
            .expect("spawn reactor");
        (mux, join, rx)
    }

    fn key(protocol: Protocol, port: u16) -> FlowKey {
        FlowKey::new(
            protocol,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        )
    }

    fn next(rx: &mpsc::Receiver<(UpstreamHandle, Seen)>) -> (UpstreamHandle, Seen) {
        rx.recv_timeout(Duration::from_secs(5)).expect("reactor event")
    }

    #[test]
    fn test_tcp_echo_through_reactor() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).expect("read");
            conn.write_all(&buf).expect("write");
        });

        let (mux, join, rx) = start();
        let handle = mux
            .register(key(Protocol::Tcp, port), SocketAddr::from(([127, 0, 0, 1], port)))
            .expect("register");
        mux.send(handle, Bytes::from_static(b"hello"));

        assert_eq!(next(&rx), (handle, Seen::Connected));
        let mut echoed = Vec::new();
        loop {
            match next(&rx) {
                (h, Seen::Data(d)) if h == handle => echoed.extend_from_slice(&d),
                (h, Seen::Eof) if h == handle => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(echoed, b"hello");

        server.join().expect("server");
        mux.close(handle);
        mux.close(handle);
        mux.stop();
        join.join().expect("reactor join");
    }

    #[test]
    fn test_refused_connect_reports_error_event() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let (mux, join, rx) = start();
        let handle = match mux.register(
            key(Protocol::Tcp, port),
            SocketAddr::from(([127, 0, 0, 1], port)),
        ) {
            Ok(handle) => handle,
            // Some kernels refuse loopback connects synchronously.
            Err(MuxError::Socket(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                mux.stop();
                join.join().expect("reactor join");
                return;
            }
            Err(e) => panic!("unexpected register error: {e}"),
        };
        assert_eq!(next(&rx), (handle, Seen::Error));
        mux.stop();
        join.join().expect("reactor join");
    }

    #[test]
    fn test_udp_roundtrip() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind udp");
        let port = server.local_addr().expect("addr").port();
        let (mux, join, rx) = start();
        let handle = mux
            .register(key(Protocol::Udp, port), SocketAddr::from(([127, 0, 0, 1], port)))
            .expect("register");
        mux.send(handle, Bytes::from_static(b"dns?"));

        let mut buf = [0u8; 16];
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        let (n, from) = server.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"dns?");
        server.send_to(b"dns!", from).expect("reply");

        assert_eq!(next(&rx), (handle, Seen::Data(b"dns!".to_vec())));
        mux.stop();
        join.join().expect("reactor join");
    }

    #[test]
    fn test_register_after_stop_is_rejected() {
        let (mux, join, _rx) = start();
        mux.stop();
        mux.stop();
        join.join().expect("reactor join");
        let err = mux
            .register(key(Protocol::Tcp, 9), SocketAddr::from(([127, 0, 0, 1], 9)))
            .expect_err("stopped");
        assert!(matches!(err, MuxError::Stopped));
    }
}
