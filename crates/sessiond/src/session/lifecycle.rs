//! The per-session connection state machine.
//!
//! ```text
//!            connect()              handshake ok
//! Disconnected ──────► Connecting ───────────────► Connected
//!      ▲                   │                           │
//!      └───────────────────┴───────────────────────────┘
//!   timeout / failure / disconnect()     transport exit / disconnect()
//! ```
//!
//! Every transition bumps or checks a generation counter held under the same
//! lock as the state, so a handshake or transport that outlives its
//! connection attempt can never write state or emit events for a newer one.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use protocol::{ConnectionState, SessionConfig, SessionKind, SessionSummary};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RelaySender, SessionError, SessionId, SessionOptions, TermSize};
use crate::transport::{self, TransportContext, TransportHandle};

enum Conn {
    Disconnected,
    Connecting { cancel: CancellationToken },
    Connected(TransportHandle),
}

struct Inner {
    generation: u64,
    conn: Conn,
    size: TermSize,
}

/// State shared between a session and its transport task.
pub(crate) struct SessionShared {
    inner: Mutex<Inner>,
}

impl SessionShared {
    fn new(size: TermSize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                generation: 0,
                conn: Conn::Disconnected,
                size,
            }),
        }
    }

    /// Move a `Connected` session of the given generation to `Disconnected`.
    ///
    /// Returns `false` if that connection is no longer current.
    pub(crate) fn release_if_current(&self, generation: u64) -> bool {
        let released = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || !matches!(inner.conn, Conn::Connected(_)) {
                return false;
            }
            inner.generation += 1;
            std::mem::replace(&mut inner.conn, Conn::Disconnected)
        };
        drop(released);
        true
    }
}

/// One interactive session: immutable configuration plus connection state.
///
/// The transport is allocated lazily by [`Session::connect`] and is owned
/// exclusively by this session.
pub struct Session {
    id: SessionId,
    config: Arc<SessionConfig>,
    options: Arc<SessionOptions>,
    shared: Arc<SessionShared>,
    output: Mutex<Option<RelaySender>>,
}

impl Session {
    /// Create a disconnected session with a fresh identifier.
    pub fn new(config: SessionConfig, options: Arc<SessionOptions>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), config, options)
    }

    pub fn with_id(id: SessionId, config: SessionConfig, options: Arc<SessionOptions>) -> Self {
        let size = options.default_size;
        Self {
            id,
            config: Arc::new(config),
            options,
            shared: Arc::new(SessionShared::new(size)),
            output: Mutex::new(None),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.config.kind()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        match self.shared.inner.lock().conn {
            Conn::Disconnected => ConnectionState::Disconnected,
            Conn::Connecting { .. } => ConnectionState::Connecting,
            Conn::Connected(_) => ConnectionState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current terminal size, applied on the next connect.
    pub fn size(&self) -> TermSize {
        self.shared.inner.lock().size
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            kind: self.kind(),
            state: self.state(),
        }
    }

    /// Bind the output sink. A session has at most one; binding replaces it.
    pub fn bind_output(&self, sink: RelaySender) {
        *self.output.lock() = Some(sink);
    }

    pub fn unbind_output(&self) {
        self.output.lock().take();
    }

    /// Connect the transport.
    ///
    /// Allowed only from `Disconnected`. The handshake runs on its own task
    /// and is raced against the kind's connect timeout; on expiry the
    /// handshake is cancelled and any transport it still produces is torn
    /// down.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let output = self
            .output
            .lock()
            .clone()
            .ok_or_else(|| SessionError::HandshakeFailed("session has no output sink".into()))?;

        let (generation, cancel, size) = {
            let mut inner = self.shared.inner.lock();
            if !matches!(inner.conn, Conn::Disconnected) {
                return Err(SessionError::AlreadyConnected(self.id.clone()));
            }
            inner.generation += 1;
            let cancel = CancellationToken::new();
            inner.conn = Conn::Connecting {
                cancel: cancel.clone(),
            };
            (inner.generation, cancel, inner.size)
        };

        let kind = self.kind();
        let timeout = self.options.connect_timeout(kind);
        info!(session_id = %self.id, kind = %kind, generation, "Connecting session");

        let ctx = TransportContext {
            session_id: self.id.clone(),
            generation,
            cancel: cancel.clone(),
            shared: Arc::clone(&self.shared),
            output,
        };
        let config = Arc::clone(&self.config);
        let options = Arc::clone(&self.options);
        let (result_tx, result_rx) = oneshot::channel();

        // The handshake outlives this future if the caller gives up, so a
        // transport that resolves late is still torn down.
        tokio::spawn(async move {
            let result = transport::open(&config, &options, size, ctx).await;
            if let Err(Ok(handle)) = result_tx.send(result) {
                handle.shutdown().await;
            }
        });

        let handle = match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(Ok(handle))) => handle,
            Ok(Ok(Err(e))) => {
                self.abandon(generation);
                warn!(session_id = %self.id, error = %e, "Handshake failed");
                return Err(e);
            }
            Ok(Err(_)) => {
                self.abandon(generation);
                return Err(SessionError::HandshakeFailed(
                    "handshake task ended unexpectedly".into(),
                ));
            }
            Err(_) => {
                cancel.cancel();
                self.abandon(generation);
                warn!(session_id = %self.id, timeout_ms = timeout.as_millis() as u64, "Handshake timed out");
                return Err(SessionError::HandshakeTimeout(timeout));
            }
        };

        let rejected = {
            let mut inner = self.shared.inner.lock();
            if inner.generation == generation && matches!(inner.conn, Conn::Connecting { .. }) {
                let mut handle = handle;
                handle.start();
                inner.conn = Conn::Connected(handle);
                None
            } else {
                Some(handle)
            }
        };

        match rejected {
            None => {
                info!(session_id = %self.id, "Session connected");
                Ok(())
            }
            Some(handle) => {
                handle.shutdown().await;
                Err(SessionError::HandshakeFailed(
                    "connect aborted by disconnect".into(),
                ))
            }
        }
    }

    /// Return a failed connect attempt to `Disconnected` if it is still current.
    fn abandon(&self, generation: u64) {
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation && matches!(inner.conn, Conn::Connecting { .. }) {
            inner.generation += 1;
            inner.conn = Conn::Disconnected;
        }
    }

    /// Disconnect the transport. Idempotent and infallible.
    ///
    /// A handshake in flight is cancelled; a live transport is shut down and
    /// its resources released before this returns.
    pub async fn disconnect(&self) {
        let previous = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            std::mem::replace(&mut inner.conn, Conn::Disconnected)
        };

        match previous {
            Conn::Disconnected => {
                debug!(session_id = %self.id, "Disconnect on disconnected session");
            }
            Conn::Connecting { cancel } => {
                cancel.cancel();
                info!(session_id = %self.id, "Handshake aborted by disconnect");
            }
            Conn::Connected(handle) => {
                handle.shutdown().await;
                info!(session_id = %self.id, "Session disconnected");
            }
        }
    }

    fn write(&self, bytes: Bytes) -> Result<(), SessionError> {
        let inner = self.shared.inner.lock();
        match &inner.conn {
            Conn::Connected(handle) => handle.write(bytes),
            _ => Err(SessionError::NotConnected(self.id.clone())),
        }
    }

    /// Write `text` followed by the kind's line terminator.
    pub fn send_command(&self, text: &str) -> Result<(), SessionError> {
        let terminator = self.kind().line_terminator();
        let mut line = String::with_capacity(text.len() + terminator.len());
        line.push_str(text);
        line.push_str(terminator);
        self.write(Bytes::from(line))
    }

    /// Forward raw input verbatim. The transport owns echo and line editing.
    pub fn handle_input(&self, data: Bytes) -> Result<(), SessionError> {
        self.write(data)
    }

    /// Resize the terminal. Best-effort: invalid sizes are ignored and a
    /// disconnected session only remembers the size for its next connect.
    pub fn resize(&self, size: TermSize) {
        if !size.is_valid() {
            debug!(session_id = %self.id, ?size, "Ignoring invalid terminal size");
            return;
        }
        let mut inner = self.shared.inner.lock();
        inner.size = size;
        if let Conn::Connected(handle) = &inner.conn {
            handle.resize(size);
        }
    }

    /// A new, disconnected session with the same configuration and a fresh
    /// identifier. Never shares the transport.
    pub fn duplicate(&self) -> Session {
        let copy = Session {
            id: Uuid::new_v4().to_string(),
            config: Arc::new(SessionConfig::clone(&self.config)),
            options: Arc::clone(&self.options),
            shared: Arc::new(SessionShared::new(self.size())),
            output: Mutex::new(None),
        };
        debug!(source = %self.id, session_id = %copy.id, "Session duplicated");
        copy
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}
