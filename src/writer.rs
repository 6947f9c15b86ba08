//! Packet writer: drains synthesized packets into the tunnel on its own thread.

use std::io::{self, ErrorKind, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::packet::MAX_WRITE_LEN;

const IDLE_WAIT: Duration = Duration::from_millis(250);
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Unbounded MPSC packet queue with a blocking consumer.
#[derive(Debug, Default)]
pub struct PacketQueue {
    queue: SegQueue<Bytes>,
    lock: Mutex<()>,
    ready: Condvar,
    closed: AtomicBool,
}

impl PacketQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet for the tunnel. Returns false if it was refused.
    pub fn push(&self, packet: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        if packet.len() > MAX_WRITE_LEN {
            warn!(len = packet.len(), "packet_too_large_dropped");
            return false;
        }
        self.queue.push(packet);
        let _guard = self.lock.lock();
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for the next packet.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        if let Some(packet) = self.queue.pop() {
            return Some(packet);
        }
        let mut guard = self.lock.lock();
        if self.queue.is_empty() && !self.is_closed() {
            self.ready.wait_for(&mut guard, timeout);
        }
        drop(guard);
        self.queue.pop()
    }

    /// Refuse new packets and wake the consumer so it can drain and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

fn is_fatal_tunnel_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::ConnectionRefused
    ) {
        return true;
    }
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::EBADF | Errno::EIO | Errno::ENODEV)
    )
}

#[derive(Debug, Default)]
pub struct WriterStats {
    pub written: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
}

/// Start the writer thread. `on_fatal` runs once if the tunnel goes away.
pub fn spawn<W, F>(
    mut tunnel: W,
    queue: Arc<PacketQueue>,
    stats: Arc<WriterStats>,
    on_fatal: F,
) -> io::Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
    F: FnOnce(io::Error) + Send + 'static,
{
    std::thread::Builder::new()
        .name("tunsnare-writer".to_string())
        .spawn(move || {
            let mut retry: Option<Bytes> = None;
            loop {
                let packet = match retry.take() {
                    Some(packet) => packet,
                    None => match queue.pop_timeout(IDLE_WAIT) {
                        Some(packet) => packet,
                        None if queue.is_closed() => break,
                        None => continue,
                    },
                };

                match tunnel.write(&packet) {
                    Ok(n) if n == packet.len() => {
                        stats.written.fetch_add(1, Ordering::Relaxed);
                        trace!(len = n, "tun_packet_written");
                    }
                    Ok(n) => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(written = n, len = packet.len(), "tun_short_write");
                    }
                    Err(e) if is_fatal_tunnel_error(&e) => {
                        warn!(error = ?e.to_string(), "tun_write_fatal");
                        on_fatal(e);
                        break;
                    }
                    Err(e) if queue.is_closed() => {
                        // Shutting down: best effort only.
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(error = ?e.to_string(), "tun_write_failed_during_shutdown");
                    }
                    Err(e) => {
                        stats.retried.fetch_add(1, Ordering::Relaxed);
                        debug!(error = ?e.to_string(), "tun_write_retry");
                        retry = Some(packet);
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
            let _ = tunnel.flush();
            info!(
                written = stats.written.load(Ordering::Relaxed),
                dropped = stats.dropped.load(Ordering::Relaxed),
                "packet_writer_stopped"
            );
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Sink {
        tx: mpsc::Sender<Vec<u8>>,
        fail_first: usize,
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_first > 0 {
                self.fail_first -= 1;
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let _ = self.tx.send(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(Errno::EBADF as i32))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_queue_rejects_after_close_and_oversized() {
        let queue = PacketQueue::new();
        assert!(!queue.push(Bytes::from(vec![0u8; MAX_WRITE_LEN + 1])));
        assert!(queue.push(Bytes::from_static(b"a")));
        queue.close();
        assert!(!queue.push(Bytes::from_static(b"b")));
        assert_eq!(queue.pop_timeout(Duration::ZERO), Some(Bytes::from_static(b"a")));
        assert_eq!(queue.pop_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_writer_preserves_order_and_retries_transient_errors() {
        let (tx, rx) = mpsc::channel();
        let queue = Arc::new(PacketQueue::new());
        let stats = Arc::new(WriterStats::default());
        for i in 0..5u8 {
            assert!(queue.push(Bytes::from(vec![i])));
        }
        let join = spawn(
            Sink { tx, fail_first: 2 },
            Arc::clone(&queue),
            Arc::clone(&stats),
            |_| panic!("not fatal"),
        )
        .expect("spawn writer");

        let got: Vec<Vec<u8>> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("packet"))
            .collect();
        assert_eq!(got, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());

        queue.close();
        join.join().expect("writer join");
        assert_eq!(stats.written.load(Ordering::Relaxed), 5);
        assert_eq!(stats.retried.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_writer_reports_closed_tunnel_once() {
        let queue = Arc::new(PacketQueue::new());
        queue.push(Bytes::from_static(b"x"));
        let (tx, rx) = mpsc::channel();
        let join = spawn(
            Broken,
            Arc::clone(&queue),
            Arc::new(WriterStats::default()),
            move |e| {
                let _ = tx.send(e.raw_os_error());
            },
        )
        .expect("spawn writer");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("fatal"),
            Some(Errno::EBADF as i32)
        );
        join.join().expect("writer join");
    }
}
