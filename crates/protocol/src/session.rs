//! Session kinds and their immutable configuration values.
//!
//! A consumer creates a session by naming a [`SessionKind`] and supplying a
//! JSON configuration object. [`SessionConfig::from_parts`] turns that pair
//! into a typed configuration, rejecting reserved kinds and malformed input.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Every kind of session the desktop shell knows about.
///
/// Only [`SessionKind::Local`] and [`SessionKind::Ssh`] have transports; the
/// rest are reserved so consumers can name them without a protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Ssh,
    Ftp,
    Sftp,
    Telnet,
    Webdav,
    Vnc,
    Serial,
}

impl SessionKind {
    /// All kinds, in declaration order.
    pub const ALL: [SessionKind; 8] = [
        SessionKind::Local,
        SessionKind::Ssh,
        SessionKind::Ftp,
        SessionKind::Sftp,
        SessionKind::Telnet,
        SessionKind::Webdav,
        SessionKind::Vnc,
        SessionKind::Serial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Local => "local",
            SessionKind::Ssh => "ssh",
            SessionKind::Ftp => "ftp",
            SessionKind::Sftp => "sftp",
            SessionKind::Telnet => "telnet",
            SessionKind::Webdav => "webdav",
            SessionKind::Vnc => "vnc",
            SessionKind::Serial => "serial",
        }
    }

    /// Whether a transport exists for this kind.
    pub fn is_implemented(&self) -> bool {
        matches!(self, SessionKind::Local | SessionKind::Ssh)
    }

    /// Line terminator appended by `send_command`.
    ///
    /// Both implemented kinds run behind a pseudo-terminal whose line
    /// discipline expects a carriage return for Enter.
    pub fn line_terminator(&self) -> &'static str {
        match self {
            SessionKind::Local | SessionKind::Ssh | SessionKind::Telnet | SessionKind::Serial => {
                "\r"
            }
            _ => "\r\n",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a session as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Summary of a tracked session, used in listings and lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Session kind.
    pub kind: SessionKind,
    /// Connection state at the time the summary was taken.
    pub state: ConnectionState,
}

/// A shell executable found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellInfo {
    /// Display name (the executable's file name).
    pub name: String,
    /// Absolute path to the executable.
    pub path: String,
}

/// Configuration of a local pseudo-terminal session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Shell executable. `None` means the daemon's configured default shell.
    #[serde(alias = "shellPath")]
    pub shell_path: Option<String>,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory. `None` means the user's home directory.
    pub cwd: Option<String>,
    /// Environment overrides layered on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl LocalConfig {
    pub fn validate(&self) -> Result<()> {
        if matches!(self.shell_path.as_deref(), Some(p) if p.trim().is_empty()) {
            return Err(ProtocolError::InvalidConfig(
                "shell_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Credentials for an SSH session. Exactly one method is ever present.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Password authentication.
    Password(String),
    /// Public key authentication with PEM/OpenSSH private key material.
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"<redacted>")
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

/// Configuration of a remote SSH session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SshConfigWire", into = "SshConfigWire")]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Expected server key fingerprint (SHA-256, base64). When unset any key
    /// is accepted and its fingerprint is logged.
    pub host_key_fingerprint: Option<String>,
}

impl SshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ProtocolError::InvalidConfig("port must be non-zero".into()));
        }
        if self.username.is_empty() {
            return Err(ProtocolError::InvalidConfig(
                "username must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Flat wire form of [`SshConfig`], as the desktop shell sends it.
#[derive(Serialize, Deserialize)]
struct SshConfigWire {
    host: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, alias = "privateKey", skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    passphrase: Option<String>,
    #[serde(
        default,
        alias = "hostKeyFingerprint",
        skip_serializing_if = "Option::is_none"
    )]
    host_key_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl TryFrom<SshConfigWire> for SshConfig {
    type Error = ProtocolError;

    fn try_from(wire: SshConfigWire) -> Result<Self> {
        let auth = match (wire.password, wire.private_key) {
            (Some(password), None) => SshAuth::Password(password),
            (None, Some(key)) => SshAuth::PrivateKey {
                key,
                passphrase: wire.passphrase,
            },
            (Some(_), Some(_)) => {
                return Err(ProtocolError::InvalidConfig(
                    "exactly one of password or private_key is allowed".into(),
                ))
            }
            (None, None) => {
                return Err(ProtocolError::InvalidConfig(
                    "one of password or private_key is required".into(),
                ))
            }
        };
        Ok(SshConfig {
            host: wire.host,
            port: wire.port,
            username: wire.username,
            auth,
            host_key_fingerprint: wire.host_key_fingerprint,
        })
    }
}

impl From<SshConfig> for SshConfigWire {
    fn from(config: SshConfig) -> Self {
        let (password, private_key, passphrase) = match config.auth {
            SshAuth::Password(p) => (Some(p), None, None),
            SshAuth::PrivateKey { key, passphrase } => (None, Some(key), passphrase),
        };
        SshConfigWire {
            host: config.host,
            port: config.port,
            username: config.username,
            password,
            private_key,
            passphrase,
            host_key_fingerprint: config.host_key_fingerprint,
        }
    }
}

/// Immutable configuration of a session, tagged by transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionConfig {
    Local(LocalConfig),
    Ssh(SshConfig),
}

impl SessionConfig {
    /// Build a typed configuration from a kind and its JSON configuration.
    ///
    /// Reserved kinds fail with [`ProtocolError::UnsupportedKind`] before the
    /// configuration is inspected.
    pub fn from_parts(kind: SessionKind, config: serde_json::Value) -> Result<Self> {
        let config = match kind {
            SessionKind::Local => {
                // A bare `null` means "default shell".
                let config = if config.is_null() {
                    LocalConfig::default()
                } else {
                    serde_json::from_value(config).map_err(invalid_config)?
                };
                config.validate()?;
                SessionConfig::Local(config)
            }
            SessionKind::Ssh => {
                let config: SshConfig =
                    serde_json::from_value(config).map_err(invalid_config)?;
                config.validate()?;
                SessionConfig::Ssh(config)
            }
            other => return Err(ProtocolError::UnsupportedKind(other)),
        };
        Ok(config)
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            SessionConfig::Local(_) => SessionKind::Local,
            SessionConfig::Ssh(_) => SessionKind::Ssh,
        }
    }
}

fn invalid_config(err: serde_json::Error) -> ProtocolError {
    ProtocolError::InvalidConfig(err.to_string())
}
