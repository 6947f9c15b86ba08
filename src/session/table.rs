use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{FlowKey, Protocol, Session, TcpState};

pub type SessionRef = Arc<Mutex<Session>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeouts {
    pub udp: Duration,
    pub half_open: Duration,
    pub established: Duration,
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        IdleTimeouts {
            udp: Duration::from_secs(60),
            half_open: Duration::from_secs(30),
            established: Duration::from_secs(600),
        }
    }
}

impl IdleTimeouts {
    #[must_use]
    pub fn is_expired(&self, session: &Session, now: Instant) -> bool {
        if session.closed {
            return true;
        }
        let idle = now.saturating_duration_since(session.last_activity);
        match (session.key.protocol, session.tcp_state()) {
            (Protocol::Udp, _) => idle >= self.udp,
            (Protocol::Tcp, Some(TcpState::Closed)) => true,
            (Protocol::Tcp, Some(state)) if state.is_transitional() => idle >= self.half_open,
            (Protocol::Tcp, _) => idle >= self.established,
        }
    }
}

/// Concurrent flow table. Lookups hand out cloned `Arc`s so no map guard is
/// ever held while a session lock is taken.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<FlowKey, SessionRef>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        SessionTable {
            sessions: DashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<SessionRef> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the session for `key`, creating it with `create` when absent.
    /// The boolean is true when this call inserted it.
    pub fn get_or_try_insert<E>(
        &self,
        key: FlowKey,
        create: impl FnOnce() -> Result<Session, E>,
    ) -> Result<(SessionRef, bool), E> {
        match self.sessions.entry(key) {
            Entry::Occupied(existing) => Ok((Arc::clone(existing.get()), false)),
            Entry::Vacant(slot) => {
                let session = Arc::new(Mutex::new(create()?));
                slot.insert(Arc::clone(&session));
                Ok((session, true))
            }
        }
    }

    /// Remove `key` only if it still maps to `session`; a newer session that
    /// reused the same 5-tuple is left alone.
    pub fn remove(&self, key: &FlowKey, session: &SessionRef) -> bool {
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionRef> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Empty the table, returning everything that was in it.
    pub fn drain(&self) -> Vec<SessionRef> {
        let keys: Vec<FlowKey> = self.sessions.iter().map(|entry| *entry.key()).collect();
        keys.iter()
            .filter_map(|key| self.sessions.remove(key).map(|(_, session)| session))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RedirectTarget, TcpControl};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            Protocol::Tcp,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), port),
            SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 80),
        )
    }

    fn session(key: FlowKey) -> Session {
        Session::new(
            key,
            RedirectTarget::PassThrough(key.remote),
            Some(TcpControl::new(1, 1, 1024, None, None)),
        )
    }

    #[test]
    fn test_get_or_insert_keeps_one_session_per_key() {
        let table = SessionTable::new();
        let (first, created) = table
            .get_or_try_insert::<()>(key(1000), || Ok(session(key(1000))))
            .expect("insert");
        assert!(created);

        let (second, created) = table
            .get_or_try_insert::<()>(key(1000), || panic!("must not rebuild"))
            .expect("lookup");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_failed_create_leaves_no_entry() {
        let table = SessionTable::new();
        let result = table.get_or_try_insert(key(1), || Err("emfile"));
        assert_eq!(result.err(), Some("emfile"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_produce_single_session() {
        let table = Arc::new(SessionTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let (s, _) = table
                        .get_or_try_insert::<()>(key(7), || Ok(session(key(7))))
                        .expect("insert");
                    s
                })
            })
            .collect();
        let sessions: Vec<SessionRef> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(table.len(), 1);
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_remove_ignores_replaced_session() {
        let table = SessionTable::new();
        let (old, _) = table
            .get_or_try_insert::<()>(key(5), || Ok(session(key(5))))
            .expect("insert");
        assert!(table.remove(&key(5), &old));
        let (_new, _) = table
            .get_or_try_insert::<()>(key(5), || Ok(session(key(5))))
            .expect("insert");
        assert!(!table.remove(&key(5), &old));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_idle_timeouts_by_state() {
        let timeouts = IdleTimeouts::default();
        let now = Instant::now();
        let mut s = session(key(9));
        s.last_activity = now - Duration::from_secs(31);
        assert!(timeouts.is_expired(&s, now), "half-open past 30s");

        if let Some(tcp) = s.tcp.as_mut() {
            tcp.state = TcpState::Established;
        }
        assert!(!timeouts.is_expired(&s, now));

        s.closed = true;
        assert!(timeouts.is_expired(&s, now));
    }

    #[test]
    fn test_drain_empties_table() {
        let table = SessionTable::new();
        for port in 1..=3 {
            table
                .get_or_try_insert::<()>(key(port), || Ok(session(key(port))))
                .expect("insert");
        }
        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
    }
}
