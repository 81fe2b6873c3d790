//! Consumer-facing IPC.
//!
//! The desktop shell drives the session core over newline-delimited JSON:
//! each line from the consumer is a [`protocol::Request`], each line back is a
//! [`protocol::ServerMessage`] carrying either a response or an event. The
//! same [`IpcConnection`] serves a Unix Domain Socket stream (`serve` mode) or
//! the process's own stdin/stdout (`stdio` mode, used when the desktop app
//! spawns the daemon as a sidecar).
//!
//! ## Example
//!
//! ### Server (Daemon) Side
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sessiond::events::event_channel;
//! use sessiond::ipc::IpcServer;
//! use sessiond::router::CommandRouter;
//! use sessiond::session::{RelayConfig, SessionOptions, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (events_tx, mut events) = event_channel(1024);
//!     let registry = Arc::new(SessionRegistry::new(
//!         SessionOptions::default(),
//!         RelayConfig::default(),
//!         events_tx,
//!     ));
//!     let router = Arc::new(CommandRouter::new(registry));
//!
//!     let server = IpcServer::bind(std::path::Path::new("/tmp/nxshell.sock")).await?;
//!     let conn = server.accept().await?;
//!     conn.serve(router, &mut events).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Client Side
//!
//! ```rust,no_run
//! use sessiond::ipc::IpcClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(std::path::Path::new("/tmp/nxshell.sock")).await?;
//!     for session in client.list_sessions().await? {
//!         println!("{} {}", session.id, session.kind);
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod server;

pub use client::IpcClient;
pub use server::{IpcConnection, IpcError, IpcServer, UnixConnection};
