//! Configuration management for the NxShell session daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/nxshell/sessiond.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::relay::RelayConfig;
use crate::session::{SessionOptions, SshOptions, TermSize};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("{field} must be between 100 and 300000 milliseconds, got {value}")]
    InvalidConnectTimeout { field: &'static str, value: u64 },

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("event_capacity must be greater than 0")]
    InvalidEventCapacity,

    #[error("max_chunks must be between 1 and 1024, got {0}")]
    InvalidMaxChunks(usize),

    #[error("max_latency_ms must be between 1 and 1000, got {0}")]
    InvalidMaxLatency(u64),

    #[error("input_capacity must be greater than 0")]
    InvalidInputCapacity,

    #[error("ssh term must not be empty")]
    InvalidTerm,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const CONNECT_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=300_000;

/// Main configuration structure for the session daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,

    /// Output batching configuration.
    pub relay: RelaySection,

    /// SSH transport configuration.
    pub ssh: SshSection,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,

    /// Unix socket path for `serve` mode.
    pub socket_path: Option<PathBuf>,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used by local sessions that do not name one.
    pub default_shell: String,

    /// Initial terminal columns.
    pub default_cols: u16,

    /// Initial terminal rows.
    pub default_rows: u16,

    /// Maximum number of tracked sessions.
    pub max_sessions: usize,

    /// Upper bound on spawning a local process.
    pub local_connect_timeout_ms: u64,

    /// Upper bound on the SSH connect + auth + channel handshake.
    pub ssh_connect_timeout_ms: u64,

    /// Capacity of the consumer-facing event channel.
    pub event_capacity: usize,
}

/// Output batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySection {
    /// Flush once this many chunks are buffered.
    pub max_chunks: usize,

    /// Flush this long after the first unflushed chunk.
    pub max_latency_ms: u64,

    /// Per-session capacity of the transport-to-relay queue.
    pub input_capacity: usize,
}

/// SSH transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshSection {
    /// TERM value requested for the remote pty.
    pub term: String,

    /// Keepalive interval in seconds (0 = disabled).
    pub keepalive_interval_secs: u64,

    /// Drop the connection after this many idle seconds (0 = never).
    pub inactivity_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            socket_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cols: 100,
            default_rows: 40,
            max_sessions: 64,
            local_connect_timeout_ms: 5_000,
            ssh_connect_timeout_ms: 15_000,
            event_capacity: 1024,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            max_chunks: 10,
            max_latency_ms: 16,
            input_capacity: 64,
        }
    }
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            keepalive_interval_secs: 30,
            inactivity_timeout_secs: 0,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nxshell")
        .join("sessiond.toml")
}

/// Returns the default socket path for `serve` mode.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nxshell")
        .join("sessiond.sock")
}

/// Returns the default shell for the current platform.
pub fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then_some(Duration::from_secs(secs))
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NXSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - NXSHELL_CONNECT_TIMEOUT_MS: Override both handshake timeouts
    /// - NXSHELL_SOCKET_PATH: Override the `serve` socket path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("NXSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(raw) = std::env::var("NXSHELL_CONNECT_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Overriding connect timeouts from environment: {}ms", ms);
                    self.session.local_connect_timeout_ms = ms;
                    self.session.ssh_connect_timeout_ms = ms;
                }
                Err(_) if raw.is_empty() => {}
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring invalid NXSHELL_CONNECT_TIMEOUT_MS");
                }
            }
        }

        if let Ok(path) = std::env::var("NXSHELL_SOCKET_PATH") {
            if !path.is_empty() {
                self.daemon.socket_path = Some(PathBuf::from(path));
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        for (field, value) in [
            ("local_connect_timeout_ms", session.local_connect_timeout_ms),
            ("ssh_connect_timeout_ms", session.ssh_connect_timeout_ms),
        ] {
            if !CONNECT_TIMEOUT_RANGE_MS.contains(&value) {
                return Err(ConfigError::InvalidConnectTimeout { field, value });
            }
        }

        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: session.default_cols,
                rows: session.default_rows,
            });
        }

        if session.event_capacity == 0 {
            return Err(ConfigError::InvalidEventCapacity);
        }

        if self.relay.max_chunks < 1 || self.relay.max_chunks > 1024 {
            return Err(ConfigError::InvalidMaxChunks(self.relay.max_chunks));
        }

        if self.relay.max_latency_ms < 1 || self.relay.max_latency_ms > 1000 {
            return Err(ConfigError::InvalidMaxLatency(self.relay.max_latency_ms));
        }

        if self.relay.input_capacity == 0 {
            return Err(ConfigError::InvalidInputCapacity);
        }

        if self.ssh.term.trim().is_empty() {
            return Err(ConfigError::InvalidTerm);
        }

        // Absolute shells must exist; bare names are resolved through PATH
        let shell_path = Path::new(&session.default_shell);
        let shell_ok = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&session.default_shell).is_ok()
        };
        if !shell_ok {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Runtime session options derived from the `[session]` and `[ssh]` sections.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            default_shell: self.session.default_shell.clone(),
            default_size: TermSize::new(self.session.default_cols, self.session.default_rows),
            local_connect_timeout: Duration::from_millis(self.session.local_connect_timeout_ms),
            ssh_connect_timeout: Duration::from_millis(self.session.ssh_connect_timeout_ms),
            max_sessions: self.session.max_sessions,
            ssh: SshOptions {
                term: self.ssh.term.clone(),
                keepalive_interval: secs_or_none(self.ssh.keepalive_interval_secs),
                inactivity_timeout: secs_or_none(self.ssh.inactivity_timeout_secs),
            },
        }
    }

    /// Runtime batching parameters derived from the `[relay]` section.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_chunks: self.relay.max_chunks,
            max_latency: Duration::from_millis(self.relay.max_latency_ms),
            input_capacity: self.relay.input_capacity,
        }
    }

    /// Socket path for `serve` mode, falling back to the runtime directory.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(default_socket_path)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("NXSHELL_LOG_LEVEL");
        std::env::remove_var("NXSHELL_CONNECT_TIMEOUT_MS");
        std::env::remove_var("NXSHELL_SOCKET_PATH");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert_eq!(config.session.default_cols, 100);
        assert_eq!(config.session.default_rows, 40);
        assert_eq!(config.session.local_connect_timeout_ms, 5_000);
        assert_eq!(config.session.ssh_connect_timeout_ms, 15_000);
        assert_eq!(config.relay.max_chunks, 10);
        assert_eq!(config.relay.max_latency_ms, 16);
        assert_eq!(config.ssh.term, "xterm-256color");
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[relay]
max_chunks = 32
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.relay.max_chunks, 32);
        // Other values should be defaults
        assert_eq!(config.relay.max_latency_ms, 16);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
log_dir = "/var/log/nxshell"
socket_path = "/run/user/1000/nxshell.sock"

[session]
default_shell = "/bin/zsh"
default_cols = 132
default_rows = 50
max_sessions = 8
local_connect_timeout_ms = 2000
ssh_connect_timeout_ms = 10000
event_capacity = 256

[relay]
max_chunks = 4
max_latency_ms = 8
input_capacity = 16

[ssh]
term = "xterm-color"
keepalive_interval_secs = 0
inactivity_timeout_secs = 600
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/var/log/nxshell")));
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/run/user/1000/nxshell.sock")
        );
        assert_eq!(config.session.default_shell, "/bin/zsh");
        assert_eq!(config.session.event_capacity, 256);
        assert_eq!(config.relay.input_capacity, 16);
        assert_eq!(config.ssh.inactivity_timeout_secs, 600);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[relay]
max_chunks = "ten"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.daemon.log_dir = Some(PathBuf::from("/tmp/logs"));
        original.relay.max_latency_ms = 33;
        original.ssh.keepalive_interval_secs = 5;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/sessiond.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("sessiond.toml");

        let mut original = Config::default();
        original.session.max_sessions = 12;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("sessiond.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_paths() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("nxshell"));
        assert!(path.to_string_lossy().ends_with("sessiond.toml"));
        assert!(default_socket_path().to_string_lossy().ends_with("sessiond.sock"));
    }

    #[test]
    fn test_session_options_projection() {
        let mut config = Config::default();
        config.session.ssh_connect_timeout_ms = 1234;
        config.ssh.keepalive_interval_secs = 0;
        config.ssh.inactivity_timeout_secs = 90;

        let options = config.session_options();
        assert_eq!(options.ssh_connect_timeout, Duration::from_millis(1234));
        assert_eq!(options.local_connect_timeout, Duration::from_secs(5));
        assert_eq!(options.default_size, TermSize::new(100, 40));
        assert_eq!(options.ssh.keepalive_interval, None);
        assert_eq!(options.ssh.inactivity_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_relay_config_projection() {
        let relay = Config::default().relay_config();
        assert_eq!(relay.max_chunks, 10);
        assert_eq!(relay.max_latency, Duration::from_millis(16));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("NXSHELL_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("NXSHELL_LOG_LEVEL", "");
        std::env::set_var("NXSHELL_CONNECT_TIMEOUT_MS", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_connect_timeout() {
        clear_env();
        std::env::set_var("NXSHELL_CONNECT_TIMEOUT_MS", "750");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.local_connect_timeout_ms, 750);
        assert_eq!(config.session.ssh_connect_timeout_ms, 750);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_timeout_is_ignored() {
        clear_env();
        std::env::set_var("NXSHELL_CONNECT_TIMEOUT_MS", "soon");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.ssh_connect_timeout_ms, 15_000);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_socket_path() {
        clear_env();
        std::env::set_var("NXSHELL_SOCKET_PATH", "/tmp/custom.sock");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/custom.sock"));

        clear_env();
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_default_config() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));
    }

    #[test]
    fn test_validate_connect_timeout_bounds() {
        let mut config = Config::default();
        config.session.ssh_connect_timeout_ms = 50;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConnectTimeout {
                field: "ssh_connect_timeout_ms",
                value: 50
            })
        );

        config.session.ssh_connect_timeout_ms = 15_000;
        config.session.local_connect_timeout_ms = 300_001;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConnectTimeout {
                field: "local_connect_timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_relay_bounds() {
        let mut config = Config::default();
        config.relay.max_chunks = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxChunks(0)));

        config.relay.max_chunks = 10;
        config.relay.max_latency_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxLatency(0)));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = Config::default();
        config.session.default_rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 100, rows: 0 })
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_path() {
        let mut config = Config::default();
        config.session.default_shell = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.session.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
