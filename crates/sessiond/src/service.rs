//! Service wiring.
//!
//! Builds the event channel, registry and router from a [`Config`] and hosts
//! them on either the process's stdio or a Unix socket.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, trace, warn};

use crate::config::Config;
use crate::events::{self, event_channel, EventReceiver};
use crate::ipc::{IpcConnection, IpcServer};
use crate::router::CommandRouter;
use crate::session::SessionRegistry;

/// The session core plus the consumer-facing event stream.
pub struct SessionService {
    registry: Arc<SessionRegistry>,
    router: Arc<CommandRouter>,
    events: EventReceiver,
}

impl SessionService {
    pub fn new(config: &Config) -> Self {
        let (events_tx, events) = event_channel(config.session.event_capacity);
        let registry = Arc::new(SessionRegistry::new(
            config.session_options(),
            config.relay_config(),
            events_tx,
        ));
        let router = Arc::new(CommandRouter::new(Arc::clone(&registry)));
        Self {
            registry,
            router,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Serve a single consumer on stdin/stdout.
    ///
    /// When the consumer closes its side every session is disposed.
    pub async fn run_stdio(self) -> anyhow::Result<()> {
        let Self {
            registry,
            router,
            mut events,
        } = self;

        info!("Serving consumer on stdio");
        let conn = IpcConnection::new(tokio::io::stdin(), tokio::io::stdout());
        let result = conn.serve(router, &mut events).await;

        dispose(&registry, events).await;
        result.context("stdio consumer connection failed")
    }

    /// Serve consumers on a Unix socket, one at a time, until `shutdown`
    /// resolves.
    ///
    /// Sessions outlive a consumer connection; events produced while no
    /// consumer is attached are discarded.
    pub async fn run_serve<F>(self, path: &Path, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            registry,
            router,
            mut events,
        } = self;

        let server = IpcServer::bind(path)
            .await
            .with_context(|| format!("failed to bind {}", path.display()))?;
        info!(path = %server.path().display(), "Listening for consumers");

        tokio::pin!(shutdown);

        loop {
            let conn = tokio::select! {
                _ = &mut shutdown => break,
                accepted = server.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept consumer");
                        continue;
                    }
                },
                Some(event) = events.recv() => {
                    trace!(session_id = event.session_id().unwrap_or("-"), "No consumer attached, dropping event");
                    continue;
                }
            };

            info!("Consumer connected");
            tokio::select! {
                result = conn.serve(Arc::clone(&router), &mut events) => match result {
                    Ok(()) => info!("Consumer disconnected"),
                    Err(e) => warn!(error = %e, "Consumer connection failed"),
                },
                _ = &mut shutdown => break,
            }
        }

        info!("Shutting down");
        dispose(&registry, events).await;
        Ok(())
    }
}

/// Tear down every session while discarding whatever events that produces.
async fn dispose(registry: &SessionRegistry, events: EventReceiver) {
    let draining = tokio::spawn(events::drain(events));
    registry.shutdown().await;
    draining.abort();
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                warn!("Failed to register signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received ctrl-c");
    }
}
