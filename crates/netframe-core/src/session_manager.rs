//! Session registry: owns every live [`Session`], consults a
//! [`ConnectionLimiter`] on admission, and fans out broadcasts.
//!
//! Sessions here know nothing about the transport that carries their bytes
//! — that's `netframe-server::transport::TransportStream`. Instead,
//! `SessionManager` is generic over a [`SessionHandle`], a thin send-only
//! capability the server layer implements over its real socket.

use std::{
    ops::Sub,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::{
    error::CoreError,
    limiter::ConnectionLimiter,
    session::{Session, SessionRole},
};

/// Minimal capability `SessionManager` needs from a connection to broadcast
/// to it, independent of the underlying transport.
pub trait SessionHandle: Send + Sync {
    /// Send raw bytes to this session's peer.
    ///
    /// # Errors
    ///
    /// Implementations return an error describing the transport failure;
    /// `SessionManager::broadcast` logs it and continues with the next
    /// session rather than aborting.
    fn send(&self, bytes: &[u8]) -> Result<(), CoreError>;
}

impl<T: SessionHandle + ?Sized> SessionHandle for Arc<T> {
    fn send(&self, bytes: &[u8]) -> Result<(), CoreError> {
        (**self).send(bytes)
    }
}

struct Entry<I, H>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    session: Mutex<Session<I>>,
    handle: H,
}

/// Owns every live session, keyed by session id.
pub struct SessionManager<H, I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    limiter: Arc<ConnectionLimiter>,
    entries: DashMap<u64, Entry<I, H>>,
}

impl<H, I> SessionManager<H, I>
where
    H: SessionHandle,
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Build a manager backed by `limiter` for admission control.
    #[must_use]
    pub fn new(limiter: Arc<ConnectionLimiter>) -> Self {
        Self { limiter, entries: DashMap::new() }
    }

    /// Admit and register a new session.
    ///
    /// Consults the [`ConnectionLimiter`] first; on refusal, returns
    /// `ConnectionRejected` without registering anything.
    ///
    /// # Errors
    ///
    /// `ConnectionRejected` if the limiter refuses admission for this IP.
    #[allow(clippy::expect_used)]
    pub fn add(
        &self,
        id: u64,
        remote_address: std::net::SocketAddr,
        role: SessionRole,
        now: I,
        handle: H,
    ) -> Result<(), CoreError> {
        if !self.limiter.admit(remote_address.ip()) {
            return Err(CoreError::ConnectionRejected {
                reason: format!("connection limit reached for {}", remote_address.ip()),
            });
        }

        let mut session = Session::new(id, remote_address, role, now);
        session.connect(now, None).expect("freshly constructed session is always in Init state");

        self.entries.insert(id, Entry { session: Mutex::new(session), handle });
        Ok(())
    }

    /// Remove and disconnect a session, releasing its limiter slot.
    pub fn remove(&self, id: u64) {
        if let Some((_, entry)) = self.entries.remove(&id) {
            let remote_ip = {
                let mut session = entry.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                let ip = session.remote_address().ip();
                session.disconnect();
                ip
            };
            self.limiter.close(remote_ip);
        }
    }

    /// Clone of the session state for `id`, if it exists.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Session<I>> {
        self.entries
            .get(&id)
            .map(|entry| entry.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
    }

    /// Alias for [`Self::get`] — present for parity with the source API's
    /// `TryGet`/`Get` pair, which differ only in how the caller is expected
    /// to handle absence.
    #[must_use]
    pub fn try_get(&self, id: u64) -> Option<Session<I>> {
        self.get(id)
    }

    /// Clones of every currently registered session.
    #[must_use]
    pub fn all(&self) -> Vec<Session<I>> {
        self.entries
            .iter()
            .map(|entry| entry.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
            .collect()
    }

    /// Number of currently registered sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Send `bytes` to every registered session except `except_id`.
    ///
    /// A send failure on one session is logged and does not prevent
    /// delivery to the rest.
    pub fn broadcast(&self, bytes: &[u8], except_id: Option<u64>) {
        for entry in &self.entries {
            let id = *entry.key();
            if Some(id) == except_id {
                continue;
            }
            if let Err(err) = entry.value().handle.send(bytes) {
                tracing::warn!(session_id = id, error = %err, "broadcast send failed");
            }
        }
    }

    /// Disconnect every session and release all limiter slots.
    pub fn disconnect_all(&self) {
        for entry in self.entries.iter() {
            let mut session = entry.value().session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let ip = session.remote_address().ip();
            session.disconnect();
            self.limiter.close(ip);
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::Mutex as StdMutex,
    };

    use super::*;
    use crate::limiter::LimiterConfig;

    struct RecordingHandle {
        sent: StdMutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl SessionHandle for RecordingHandle {
        fn send(&self, bytes: &[u8]) -> Result<(), CoreError> {
            if self.fail {
                return Err(CoreError::Transport("simulated failure".to_string()));
            }
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)), 9000)
    }

    fn manager() -> SessionManager<Arc<RecordingHandle>> {
        let limiter = Arc::new(ConnectionLimiter::new(LimiterConfig { max_per_ip: 10, max_total: 100 }));
        SessionManager::new(limiter)
    }

    #[test]
    fn add_then_get_round_trips() {
        let mgr = manager();
        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: false });
        mgr.add(1, addr(1), SessionRole::User, Instant::now(), handle).unwrap();

        let session = mgr.get(1).unwrap();
        assert!(session.is_connected());
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn remove_releases_limiter_slot() {
        let limiter = Arc::new(ConnectionLimiter::new(LimiterConfig { max_per_ip: 1, max_total: 100 }));
        let mgr: SessionManager<Arc<RecordingHandle>> = SessionManager::new(Arc::clone(&limiter));
        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: false });
        mgr.add(1, addr(1), SessionRole::Guest, Instant::now(), handle).unwrap();
        assert_eq!(limiter.count_for(addr(1).ip()), 1);

        mgr.remove(1);
        assert_eq!(limiter.count_for(addr(1).ip()), 0);
        assert!(mgr.get(1).is_none());
    }

    #[test]
    fn broadcast_skips_excepted_session_and_tolerates_failures() {
        let mgr = manager();
        let good = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: false });
        let bad = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: true });
        let excluded = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: false });

        mgr.add(1, addr(1), SessionRole::Guest, Instant::now(), Arc::clone(&good)).unwrap();
        mgr.add(2, addr(2), SessionRole::Guest, Instant::now(), Arc::clone(&bad)).unwrap();
        mgr.add(3, addr(3), SessionRole::Guest, Instant::now(), Arc::clone(&excluded)).unwrap();

        mgr.broadcast(b"hello", Some(3));

        assert_eq!(good.sent.lock().unwrap().len(), 1);
        assert!(excluded.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn disconnect_all_clears_registry_and_limiter() {
        let limiter = Arc::new(ConnectionLimiter::new(LimiterConfig { max_per_ip: 10, max_total: 100 }));
        let mgr: SessionManager<Arc<RecordingHandle>> = SessionManager::new(Arc::clone(&limiter));
        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: false });
        mgr.add(1, addr(1), SessionRole::Guest, Instant::now(), handle).unwrap();

        mgr.disconnect_all();
        assert_eq!(mgr.count(), 0);
        assert_eq!(limiter.total(), 0);
    }

    #[test]
    fn add_refused_past_per_ip_limit() {
        let limiter = Arc::new(ConnectionLimiter::new(LimiterConfig { max_per_ip: 1, max_total: 100 }));
        let mgr: SessionManager<Arc<RecordingHandle>> = SessionManager::new(Arc::clone(&limiter));
        let h1 = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: false });
        let h2 = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()), fail: false });

        mgr.add(1, addr(1), SessionRole::Guest, Instant::now(), h1).unwrap();
        let result = mgr.add(2, addr(1), SessionRole::Guest, Instant::now(), h2);
        assert!(matches!(result, Err(CoreError::ConnectionRejected { .. })));
    }
}
