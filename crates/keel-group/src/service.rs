//! The external coordination service interface.
//!
//! The real deployment points this at a ZooKeeper-like service; tests and
//! single-node setups use the in-process implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service is temporarily unreachable; the operation may be
    /// re-driven once the connection is re-established.
    #[error("disconnected from the coordination service")]
    Disconnected,
    #[error("coordination service error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Connected,
    Reconnecting,
    /// The session expired: every ephemeral entry created under it is gone.
    Expired,
    /// The set of ephemeral entries changed.
    Changed,
}

/// A ZooKeeper-like session-oriented store of ephemeral sequence entries.
#[async_trait]
pub trait CoordinationService: Send + Sync + 'static {
    /// Create an ephemeral entry, returning its sequence number. Entries
    /// disappear when the session that created them expires.
    async fn create_ephemeral(&self, data: Vec<u8>) -> ServiceResult<u64>;
    async fn delete(&self, sequence: u64) -> ServiceResult<bool>;
    async fn data(&self, sequence: u64) -> ServiceResult<Option<Vec<u8>>>;
    async fn list(&self) -> ServiceResult<Vec<u64>>;
    fn session(&self) -> Option<SessionId>;
    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent>;
}

/// An in-process coordination service with test controls for connection
/// loss and session expiry.
pub struct LocalCoordinationService {
    state: Mutex<LocalState>,
    events: broadcast::Sender<ServiceEvent>,
}

struct LocalState {
    connected: bool,
    session: u64,
    next_sequence: u64,
    entries: BTreeMap<u64, Vec<u8>>,
}

impl Default for LocalCoordinationService {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCoordinationService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(LocalState {
                connected: true,
                session: 1,
                next_sequence: 0,
                entries: BTreeMap::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn disconnect(&self) {
        self.lock().connected = false;
        let _ = self.events.send(ServiceEvent::Reconnecting);
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
        let _ = self.events.send(ServiceEvent::Connected);
    }

    /// Expire the session: ephemeral entries disappear and a new session
    /// starts.
    pub fn expire_session(&self) {
        {
            let mut state = self.lock();
            state.session += 1;
            state.entries.clear();
            state.connected = true;
        }
        let _ = self.events.send(ServiceEvent::Expired);
    }
}

#[async_trait]
impl CoordinationService for LocalCoordinationService {
    async fn create_ephemeral(&self, data: Vec<u8>) -> ServiceResult<u64> {
        let mut state = self.lock();
        if !state.connected {
            return Err(ServiceError::Disconnected);
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.entries.insert(sequence, data);
        drop(state);
        let _ = self.events.send(ServiceEvent::Changed);
        Ok(sequence)
    }

    async fn delete(&self, sequence: u64) -> ServiceResult<bool> {
        let mut state = self.lock();
        if !state.connected {
            return Err(ServiceError::Disconnected);
        }
        let removed = state.entries.remove(&sequence).is_some();
        drop(state);
        if removed {
            let _ = self.events.send(ServiceEvent::Changed);
        }
        Ok(removed)
    }

    async fn data(&self, sequence: u64) -> ServiceResult<Option<Vec<u8>>> {
        let state = self.lock();
        if !state.connected {
            return Err(ServiceError::Disconnected);
        }
        Ok(state.entries.get(&sequence).cloned())
    }

    async fn list(&self) -> ServiceResult<Vec<u64>> {
        let state = self.lock();
        if !state.connected {
            return Err(ServiceError::Disconnected);
        }
        Ok(state.entries.keys().copied().collect())
    }

    fn session(&self) -> Option<SessionId> {
        let state = self.lock();
        state.connected.then_some(SessionId(state.session))
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }
}
