//! Command router for dispatching consumer requests to the session registry.
//!
//! This module provides the [`CommandRouter`], which turns each decoded
//! [`Request`] into a registry call and the registry's outcome into a
//! [`Response`]. Raw input is the exception: it is fire-and-forget and
//! produces no response. Duplicate input deliveries are filtered per consumer
//! connection by [`InputDedup`] before they reach the router.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use protocol::{
    Command, CreateSession, ErrorCode, ErrorMessage, Input, ProtocolError, Reply, Request,
    Response,
};
use tracing::{debug, info, trace, warn};

use crate::session::{SessionError, SessionId, SessionRegistry, TermSize};
use crate::shells;

/// Result type for router operations.
pub type RouterResult = Result<Reply, RouterError>;

/// Errors that can occur while routing a command.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Malformed payload or configuration.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Convert the error to a wire [`ErrorMessage`].
    pub fn to_error_message(&self, session_id: Option<String>) -> ErrorMessage {
        let (code, recoverable) = match self {
            RouterError::Session(e) => match e {
                SessionError::NotFound(_) => (ErrorCode::NotFound, true),
                SessionError::UnsupportedKind(_) => (ErrorCode::UnsupportedKind, true),
                SessionError::InvalidConfig(_) => (ErrorCode::InvalidRequest, true),
                SessionError::LimitReached(_) => (ErrorCode::InvalidRequest, true),
                SessionError::NotConnected(_) => (ErrorCode::NotConnected, true),
                SessionError::AlreadyConnected(_) => (ErrorCode::InvalidRequest, true),
                SessionError::HandshakeTimeout(_) => (ErrorCode::HandshakeTimeout, true),
                SessionError::HandshakeFailed(_) => (ErrorCode::HandshakeFailed, true),
                SessionError::TransportFault(_) => (ErrorCode::Internal, true),
                SessionError::Io(_) => (ErrorCode::Internal, true),
            },
            RouterError::Protocol(ProtocolError::UnsupportedKind(_)) => {
                (ErrorCode::UnsupportedKind, true)
            }
            RouterError::Protocol(_) => (ErrorCode::InvalidRequest, false),
            RouterError::Internal(_) => (ErrorCode::Internal, true),
        };

        ErrorMessage {
            code,
            message: self.to_string(),
            session_id,
            recoverable,
        }
    }
}

/// Whether a command may wait on a handshake or transport teardown.
///
/// The transport layer runs these on their own tasks so they never hold up
/// input intake.
pub fn is_slow(command: &Command) -> bool {
    matches!(
        command,
        Command::Connect(_) | Command::Disconnect(_) | Command::Remove(_)
    )
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Create(_) => "create",
        Command::Connect(_) => "connect",
        Command::Disconnect(_) => "disconnect",
        Command::Remove(_) => "remove",
        Command::SwitchActive(_) => "switch_active",
        Command::ListSessions => "list_sessions",
        Command::ActiveSession => "active_session",
        Command::Clone(_) => "clone",
        Command::SendCommand(_) => "send_command",
        Command::Input(_) => "input",
        Command::Resize(_) => "resize",
        Command::Broadcast(_) => "broadcast",
        Command::ListShells => "list_shells",
    }
}

fn command_session(command: &Command) -> Option<&str> {
    match command {
        Command::Connect(r)
        | Command::Disconnect(r)
        | Command::Remove(r)
        | Command::SwitchActive(r)
        | Command::Clone(r) => Some(&r.session_id),
        Command::SendCommand(c) => Some(&c.session_id),
        Command::Input(i) => Some(&i.session_id),
        Command::Resize(r) => Some(&r.session_id),
        Command::Create(_)
        | Command::ListSessions
        | Command::ActiveSession
        | Command::Broadcast(_)
        | Command::ListShells => None,
    }
}

/// Drops repeated deliveries of the same input.
///
/// Input request ids increase strictly per session within one consumer
/// connection; anything at or below the last applied id is a duplicate. Ids
/// restart with each connection, so every connection owns its own filter.
#[derive(Debug, Default)]
pub struct InputDedup {
    last: HashMap<SessionId, u64>,
}

impl InputDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an input request id. Returns `false` for a duplicate or stale
    /// delivery.
    pub fn accept(&mut self, session_id: &str, request_id: u64) -> bool {
        match self.last.entry(session_id.to_string()) {
            Entry::Occupied(mut last) => {
                if request_id <= *last.get() {
                    return false;
                }
                last.insert(request_id);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(request_id);
                true
            }
        }
    }
}

/// Dispatches consumer requests to the session registry.
pub struct CommandRouter {
    registry: Arc<SessionRegistry>,
}

impl CommandRouter {
    /// Create a new router over the given registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Route a request.
    ///
    /// Returns `None` for input, which is never answered.
    pub async fn route(&self, request: Request) -> Option<Response> {
        let Request { id, command } = request;
        debug!(request_id = id, command = command_name(&command), "Routing command");

        if let Command::Input(input) = command {
            self.handle_input(input).await;
            return None;
        }

        let session_id = command_session(&command).map(str::to_string);
        let response = match self.dispatch(command).await {
            Ok(reply) => Response::ok(id, reply),
            Err(e) => {
                warn!(request_id = id, session_id = ?session_id, error = %e, "Command failed");
                Response::error(id, e.to_error_message(session_id))
            }
        };
        Some(response)
    }

    async fn dispatch(&self, command: Command) -> RouterResult {
        match command {
            Command::Create(req) => self.handle_create(req).await,
            Command::Connect(req) => {
                self.registry.connect(&req.session_id).await?;
                Ok(Reply::Ack)
            }
            Command::Disconnect(req) => {
                self.registry.disconnect(&req.session_id).await;
                Ok(Reply::Ack)
            }
            Command::Remove(req) => {
                self.registry.remove(&req.session_id).await?;
                Ok(Reply::Ack)
            }
            Command::SwitchActive(req) => {
                self.registry.switch(&req.session_id).await;
                Ok(Reply::Ack)
            }
            Command::ListSessions => Ok(Reply::Sessions(self.registry.list().await)),
            Command::ActiveSession => Ok(Reply::Active(self.registry.active().await)),
            Command::Clone(req) => {
                let session_id = self.registry.clone_session(&req.session_id).await?;
                Ok(Reply::Cloned { session_id })
            }
            Command::SendCommand(req) => {
                trace!(session_id = %req.session_id, len = req.text.len(), "Sending command");
                self.registry.send_command(&req.session_id, &req.text).await?;
                Ok(Reply::Ack)
            }
            Command::Resize(req) => {
                self.registry
                    .resize(&req.session_id, TermSize::new(req.cols, req.rows))
                    .await;
                Ok(Reply::Ack)
            }
            Command::Broadcast(req) => {
                let delivered = self.registry.broadcast(&req.text).await;
                debug!(delivered, "Broadcast routed");
                Ok(Reply::Broadcast { delivered })
            }
            Command::ListShells => {
                let shells = tokio::task::spawn_blocking(shells::available_shells)
                    .await
                    .map_err(|e| RouterError::Internal(format!("shell scan failed: {}", e)))?;
                Ok(Reply::Shells(shells))
            }
            // Answered in `route`
            Command::Input(_) => Ok(Reply::Ack),
        }
    }

    async fn handle_create(&self, req: CreateSession) -> RouterResult {
        let session_id = self.registry.create(req.kind, req.config).await?;
        info!(session_id = %session_id, kind = %req.kind, "Session created");
        Ok(Reply::Created { session_id })
    }

    async fn handle_input(&self, input: Input) {
        let Input { session_id, data } = input;
        trace!(session_id = %session_id, len = data.len(), "Forwarding input");
        if let Err(e) = self.registry.input(&session_id, Bytes::from(data)).await {
            debug!(session_id = %session_id, error = %e, "Input not applied");
        }
    }
}
