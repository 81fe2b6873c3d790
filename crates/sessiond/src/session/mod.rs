//! Session management module.
//!
//! This module owns the lifecycle of interactive sessions: the per-session
//! connection state machine ([`Session`]), the registry tracking every
//! session and the foreground one ([`SessionRegistry`]), and the relay that
//! batches transport output before it reaches the consumer ([`OutputRelay`]).

pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod relay;

use std::time::Duration;

use protocol::SessionKind;

pub use error::SessionError;
pub use lifecycle::Session;
pub use registry::SessionRegistry;
pub use relay::{OutputRelay, RelayConfig, RelaySender};

/// Unique identifier for a session.
pub type SessionId = String;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// A size with a zero dimension cannot be applied to a pty.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

/// SSH transport tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct SshOptions {
    pub term: String,
    pub keepalive_interval: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
}

/// Runtime options shared by every session of a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub default_shell: String,
    pub default_size: TermSize,
    pub local_connect_timeout: Duration,
    pub ssh_connect_timeout: Duration,
    pub max_sessions: usize,
    pub ssh: SshOptions,
}

impl SessionOptions {
    /// Handshake bound for a session kind.
    pub fn connect_timeout(&self, kind: SessionKind) -> Duration {
        match kind {
            SessionKind::Local => self.local_connect_timeout,
            _ => self.ssh_connect_timeout,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        crate::config::Config::default().session_options()
    }
}
