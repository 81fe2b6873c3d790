//! # NxShell Protocol Library
//!
//! Wire types shared by the NxShell session daemon and the desktop shell that
//! drives it.
//!
//! ## Overview
//!
//! - **Session configuration**: [`SessionKind`] and the typed, immutable
//!   [`SessionConfig`] for local pseudo-terminal and SSH sessions
//! - **Commands**: [`Request`]/[`Command`] sent by the consumer
//! - **Replies and events**: [`ServerMessage`] carrying either a [`Response`]
//!   or an [`Event`]
//!
//! Every message is a single line of JSON. Byte payloads (keystrokes and
//! terminal output) are base64 strings.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Command, CreateSession, Request, SessionConfig, SessionKind};
//!
//! let request = Request::new(
//!     1,
//!     Command::Create(CreateSession {
//!         kind: SessionKind::Local,
//!         config: serde_json::json!({"shell_path": "/bin/sh"}),
//!     }),
//! );
//! let line = request.to_json().unwrap();
//! let decoded = Request::from_json(&line).unwrap();
//!
//! if let Command::Create(create) = decoded.command {
//!     let config = SessionConfig::from_parts(create.kind, create.config).unwrap();
//!     assert_eq!(config.kind(), SessionKind::Local);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session kinds and configuration
//! - [`messages`]: Commands, responses and events
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod session;

pub use error::{ProtocolError, Result};
pub use messages::{
    Broadcast, Command, CreateSession, ErrorCode, ErrorMessage, Event, Input, Outcome, Reply,
    Request, Resize, Response, SendCommand, ServerMessage, SessionData, SessionExit, SessionRef,
    SessionRemoved, SessionSwitched, PROTOCOL_VERSION,
};
pub use session::{
    ConnectionState, LocalConfig, SessionConfig, SessionKind, SessionSummary, ShellInfo, SshAuth,
    SshConfig, DEFAULT_SSH_PORT,
};
