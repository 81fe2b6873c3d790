//! Session registry.
//!
//! The registry exclusively owns every [`Session`] and the single active
//! pointer. Mutations of the map and the pointer are serialized by one async
//! lock; connection work (handshakes, transport shutdown) always runs with the
//! lock released so a slow connect never stalls other commands.
//!
//! Lifecycle events are pushed while the lock is held so their order matches
//! the order of mutations; the push never waits on the consumer.
//!
//! Invariant: the active id is `None` exactly when the registry is empty, and
//! otherwise names a session present in the map.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use protocol::{Event, SessionConfig, SessionKind, SessionRemoved, SessionSummary, SessionSwitched};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::relay::{OutputRelay, RelayConfig};
use super::{Session, SessionError, SessionId, SessionOptions, TermSize};
use crate::events::{EventSender, LifecycleQueue};

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Insertion order; picks the successor when the active session goes.
    order: Vec<SessionId>,
    active: Option<SessionId>,
}

impl RegistryState {
    fn summary_of(&self, id: Option<&SessionId>) -> Option<SessionSummary> {
        id.and_then(|id| self.sessions.get(id)).map(|s| s.summary())
    }
}

/// Thread-safe owner of all sessions.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    relay: OutputRelay,
    lifecycle: LifecycleQueue,
    options: Arc<SessionOptions>,
}

impl SessionRegistry {
    /// Creates an empty registry publishing to `events`.
    pub fn new(options: SessionOptions, relay_config: RelayConfig, events: EventSender) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            relay: OutputRelay::new(relay_config, events.clone()),
            lifecycle: LifecycleQueue::new(events),
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn relay(&self) -> &OutputRelay {
        &self.relay
    }

    fn emit(&self, event: Event) {
        self.lifecycle.push(event);
    }

    /// Create and add a session from a kind and its JSON configuration.
    pub async fn create(
        &self,
        kind: SessionKind,
        config: serde_json::Value,
    ) -> Result<SessionId, SessionError> {
        let config = SessionConfig::from_parts(kind, config)?;
        self.create_with_config(config).await
    }

    /// Create and add a session from a typed configuration.
    pub async fn create_with_config(
        &self,
        config: SessionConfig,
    ) -> Result<SessionId, SessionError> {
        let session = Session::new(config, Arc::clone(&self.options));
        self.add(session).await
    }

    /// Insert a session, binding it to the output relay.
    ///
    /// Always emits `SessionAdded`; the first session also becomes active and
    /// emits `SessionSwitched`.
    pub async fn add(&self, session: Session) -> Result<SessionId, SessionError> {
        let mut state = self.state.lock().await;

        if state.sessions.len() >= self.options.max_sessions {
            return Err(SessionError::LimitReached(self.options.max_sessions));
        }
        let id = session.id().clone();
        if state.sessions.contains_key(&id) {
            return Err(SessionError::InvalidConfig(format!(
                "duplicate session id: {}",
                id
            )));
        }

        let session = Arc::new(session);
        session.bind_output(self.relay.attach(&id));
        let summary = session.summary();
        state.sessions.insert(id.clone(), session);
        state.order.push(id.clone());

        info!(session_id = %id, kind = %summary.kind, total = state.sessions.len(), "Session added");
        self.emit(Event::SessionAdded(summary.clone()));

        if state.active.is_none() {
            state.active = Some(id.clone());
            self.emit(Event::SessionSwitched(SessionSwitched {
                active: Some(summary),
            }));
        }

        Ok(id)
    }

    /// Disconnect and forget a session.
    ///
    /// Always succeeds for a known id, even if the transport is already
    /// broken. If the session was active, its predecessor in insertion order
    /// (or else its successor) becomes active.
    pub async fn remove(&self, id: &str) -> Result<(), SessionError> {
        let (session, was_active) = {
            let mut state = self.state.lock().await;
            let session = state
                .sessions
                .remove(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            let position = state.order.iter().position(|s| s == id);
            if let Some(position) = position {
                state.order.remove(position);
            }

            let was_active = state.active.as_deref() == Some(id);
            if was_active {
                let successor = position
                    .and_then(|p| p.checked_sub(1))
                    .and_then(|p| state.order.get(p))
                    .or_else(|| state.order.first())
                    .cloned();
                state.active = successor;
            }
            (session, was_active)
        };

        session.disconnect().await;
        session.unbind_output();
        // After this no Data event for the session can be produced
        self.relay.detach(id).await;

        let state = self.state.lock().await;
        info!(session_id = %id, remaining = state.sessions.len(), "Session removed");
        self.emit(Event::SessionRemoved(SessionRemoved {
            session_id: id.to_string(),
        }));
        if was_active {
            self.emit(Event::SessionSwitched(SessionSwitched {
                active: state.summary_of(state.active.as_ref()),
            }));
        }
        Ok(())
    }

    /// Make a session active.
    ///
    /// Returns `false` for an unknown id, which is otherwise ignored. Emits
    /// `SessionSwitched` only when the active session changes.
    pub async fn switch(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(id) {
            debug!(session_id = %id, "Ignoring switch to unknown session");
            return false;
        }
        if state.active.as_deref() == Some(id) {
            return true;
        }
        state.active = Some(id.to_string());
        let active = state.summary_of(state.active.as_ref());
        self.emit(Event::SessionSwitched(SessionSwitched { active }));
        true
    }

    /// Duplicate a session and add the copy.
    ///
    /// Returns `Ok(None)` when the source is unknown.
    pub async fn clone_session(&self, id: &str) -> Result<Option<SessionId>, SessionError> {
        let Some(source) = self.get(id).await else {
            return Ok(None);
        };
        let copy = source.duplicate();
        self.add(copy).await.map(Some)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.state.lock().await.sessions.get(id).cloned()
    }

    async fn require(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// All sessions in insertion order.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .map(|s| s.summary())
            .collect()
    }

    pub async fn active(&self) -> Option<SessionSummary> {
        let state = self.state.lock().await;
        state.summary_of(state.active.as_ref())
    }

    pub async fn active_id(&self) -> Option<SessionId> {
        self.state.lock().await.active.clone()
    }

    /// Connect a session. The registry lock is not held during the handshake.
    pub async fn connect(&self, id: &str) -> Result<(), SessionError> {
        let session = self.require(id).await?;
        session.connect().await
    }

    /// Disconnect a session. Unknown ids are ignored.
    pub async fn disconnect(&self, id: &str) {
        match self.get(id).await {
            Some(session) => session.disconnect().await,
            None => debug!(session_id = %id, "Disconnect for unknown session"),
        }
    }

    pub async fn send_command(&self, id: &str, text: &str) -> Result<(), SessionError> {
        self.require(id).await?.send_command(text)
    }

    pub async fn input(&self, id: &str, data: Bytes) -> Result<(), SessionError> {
        self.require(id).await?.handle_input(data)
    }

    /// Resize a session. Unknown ids and invalid sizes are ignored.
    pub async fn resize(&self, id: &str, size: TermSize) {
        if let Some(session) = self.get(id).await {
            session.resize(size);
        }
    }

    /// Send `text` to every session. Disconnected sessions ignore it.
    ///
    /// Returns how many sessions accepted the command.
    pub async fn broadcast(&self, text: &str) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let state = self.state.lock().await;
            state
                .order
                .iter()
                .filter_map(|id| state.sessions.get(id).cloned())
                .collect()
        };

        let mut delivered = 0;
        for session in sessions {
            match session.send_command(text) {
                Ok(()) => delivered += 1,
                Err(SessionError::NotConnected(_)) => {}
                Err(e) => warn!(session_id = %session.id(), error = %e, "Broadcast write failed"),
            }
        }
        debug!(delivered, "Broadcast sent");
        delivered
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Dispose of every session without emitting events.
    ///
    /// Used when the consumer goes away: all transports are torn down and all
    /// batchers stopped.
    pub async fn shutdown(&self) {
        let sessions = {
            let mut state = self.state.lock().await;
            state.active = None;
            state.order.clear();
            std::mem::take(&mut state.sessions)
        };

        let count = sessions.len();
        for session in sessions.into_values() {
            session.disconnect().await;
            session.unbind_output();
        }
        self.relay.shutdown().await;
        info!(count, "Session registry shut down");
    }
}
