//! # NxShell Session Daemon Library
//!
//! The session-management and transport-multiplexing core of the NxShell
//! desktop terminal client.
//!
//! ## Overview
//!
//! - **Sessions**: local pseudo-terminal and SSH sessions behind one
//!   [`Session`] type with a `Disconnected → Connecting → Connected` state
//!   machine
//! - **Registry**: ownership of every session plus the single active pointer
//! - **Output relay**: per-session batching of transport output into
//!   `Data` events
//! - **Router and IPC**: newline-delimited JSON commands and events for the
//!   desktop shell, on stdio or a Unix socket
//!
//! ## Architecture
//!
//! ```text
//!  consumer ──Request──► CommandRouter ──► SessionRegistry ──► Session ──► Transport
//!      ▲                                         │                            │
//!      │                                   lifecycle events              output chunks
//!      │                                         ▼                            ▼
//!      └────────────── ServerMessage ◄──── event channel ◄────────── OutputRelay
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessiond::{Config, SessionService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     SessionService::new(&config).run_stdio().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Sessions, registry and output relay
//! - [`transport`]: Local pty and SSH adapters
//! - [`router`]: Command dispatch
//! - [`ipc`]: Consumer connections and client
//! - [`service`]: Wiring and hosting modes

pub mod config;
pub mod events;
pub mod ipc;
pub mod router;
pub mod service;
pub mod session;
pub mod shells;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use events::{event_channel, EventReceiver, EventSender, LifecycleQueue};
pub use ipc::{IpcClient, IpcConnection, IpcError, IpcServer};
pub use router::{CommandRouter, InputDedup, RouterError, RouterResult};
pub use service::SessionService;
pub use session::{
    OutputRelay, RelayConfig, Session, SessionError, SessionId, SessionOptions, SessionRegistry,
    TermSize,
};
