//! Boundary message definitions for the NxShell session daemon.
//!
//! The desktop shell sends [`Request`]s carrying a [`Command`] and receives
//! [`ServerMessage`]s: either the [`Response`] to one of its requests or an
//! [`Event`] from the session core. Every message is one line of JSON.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::{SessionKind, SessionSummary, ShellInfo};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serde adapter encoding byte payloads as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A request from the consumer. `id` correlates the [`Response`] and, for
/// input, orders keystrokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Commands consumed by the session core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Create a session of the given kind.
    Create(CreateSession),
    /// Connect a session (spawn the process or perform the SSH handshake).
    Connect(SessionRef),
    /// Disconnect a session. Always succeeds.
    Disconnect(SessionRef),
    /// Disconnect and forget a session.
    Remove(SessionRef),
    /// Make a session the foreground session. Unknown ids are ignored.
    SwitchActive(SessionRef),
    /// List all tracked sessions.
    ListSessions,
    /// Report the active session, if any.
    ActiveSession,
    /// Create a fresh session with the same configuration.
    Clone(SessionRef),
    /// Write a line to a session.
    SendCommand(SendCommand),
    /// Forward raw keystrokes to a session. No response is sent.
    Input(Input),
    /// Resize a session's terminal. Always succeeds.
    Resize(Resize),
    /// Write a line to every connected session.
    Broadcast(Broadcast),
    /// List shells available on the host.
    ListShells,
}

impl Command {
    /// Whether the core answers this command with a [`Response`].
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::Input(_))
    }
}

/// Parameters of [`Command::Create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSession {
    pub kind: SessionKind,
    /// Kind-specific configuration object.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A command addressing one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
}

impl SessionRef {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

/// Parameters of [`Command::SendCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCommand {
    pub session_id: String,
    pub text: String,
}

/// Parameters of [`Command::Input`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub session_id: String,
    /// Raw bytes, forwarded verbatim.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Parameters of [`Command::Resize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// Parameters of [`Command::Broadcast`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub text: String,
}

// ============================================================================
// Responses
// ============================================================================

/// Response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: u64,
    pub result: Outcome,
}

impl Response {
    pub fn ok(id: u64, reply: Reply) -> Self {
        Self {
            id,
            result: Outcome::Ok(reply),
        }
    }

    pub fn error(id: u64, error: ErrorMessage) -> Self {
        Self {
            id,
            result: Outcome::Error(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.result, Outcome::Ok(_))
    }
}

/// Success or failure of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Outcome {
    Ok(Reply),
    Error(ErrorMessage),
}

/// Successful command results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Reply {
    /// Command completed with nothing to report.
    Ack,
    /// A session was created.
    Created { session_id: String },
    /// Result of a clone; `None` when the source session is unknown.
    Cloned { session_id: Option<String> },
    /// All tracked sessions.
    Sessions(Vec<SessionSummary>),
    /// The active session.
    Active(Option<SessionSummary>),
    /// Shells found on the host.
    Shells(Vec<ShellInfo>),
    /// Result of a broadcast: how many connected sessions took the line.
    Broadcast { delivered: usize },
}

/// Error payload returned in place of a [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Session the error concerns, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Whether retrying (possibly after user action) can succeed.
    pub recoverable: bool,
}

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The session id is unknown.
    NotFound,
    /// The session kind has no transport.
    UnsupportedKind,
    /// The session is not connected.
    NotConnected,
    /// The handshake did not finish in time.
    HandshakeTimeout,
    /// The handshake failed (spawn error, auth failure, unreachable host).
    HandshakeFailed,
    /// Malformed request or configuration.
    InvalidRequest,
    /// Unexpected internal error.
    Internal,
}

// ============================================================================
// Events
// ============================================================================

/// Events produced by the session core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A session was added to the registry.
    SessionAdded(SessionSummary),
    /// A session was removed from the registry.
    SessionRemoved(SessionRemoved),
    /// The active session changed. `active` is `None` once the registry is empty.
    SessionSwitched(SessionSwitched),
    /// A batch of output from a session, in byte order.
    Data(SessionData),
    /// A session's transport ended.
    Exit(SessionExit),
}

impl Event {
    /// The session an event is scoped to. `SessionSwitched` to an empty
    /// registry has none.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::SessionAdded(s) => Some(&s.id),
            Event::SessionRemoved(e) => Some(&e.session_id),
            Event::SessionSwitched(e) => e.active.as_ref().map(|s| s.id.as_str()),
            Event::Data(e) => Some(&e.session_id),
            Event::Exit(e) => Some(&e.session_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRemoved {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSwitched {
    pub active: Option<SessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExit {
    pub session_id: String,
    /// Exit code, when the transport reported one.
    pub code: Option<i32>,
    /// Terminating signal name, when the transport reported one.
    pub signal: Option<String>,
}

// ============================================================================
// Server -> consumer framing
// ============================================================================

/// A line sent from the core to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when a consumer attaches.
    Hello { version: u8 },
    Response(Response),
    Event(Event),
}

impl ServerMessage {
    pub fn hello() -> Self {
        ServerMessage::Hello {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}
