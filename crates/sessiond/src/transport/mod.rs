//! Transport adapters.
//!
//! A transport owns the OS or network resource a session rides on and runs as
//! one task per connection. The session talks to that task through a
//! [`TransportHandle`]; the task talks back through its [`TransportContext`].
//!
//! Every transport task follows the same shape:
//! 1. the handshake runs inside [`open`], racing the context's cancellation
//!    token so an aborted connect releases partial resources;
//! 2. after the handshake the task waits on the start gate, which the session
//!    opens only once it has committed to `Connected`;
//! 3. commands arrive on a single FIFO queue, so input is applied in order by
//!    one writer;
//! 4. when the transport ends on its own the task calls
//!    [`TransportContext::finish`], which is a no-op if the session has since
//!    been disconnected or reconnected.

pub mod local;
pub mod ssh;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use protocol::SessionConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::lifecycle::SessionShared;
use crate::session::{RelaySender, SessionError, SessionId, SessionOptions, TermSize};

/// Commands applied by a transport task, in arrival order.
#[derive(Debug)]
pub enum TransportCommand {
    /// Raw bytes for the remote side.
    Write(Bytes),
    /// New terminal size.
    Resize(TermSize),
}

/// Session-side handle to a running transport task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    start: Option<oneshot::Sender<()>>,
}

/// Task-side ends of a [`TransportHandle`].
pub(crate) struct TransportIo {
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    start: oneshot::Receiver<()>,
}

impl TransportIo {
    /// Wait until the session commits the connection.
    ///
    /// Returns `false` if the connect was abandoned or cancelled instead.
    pub async fn wait_for_start(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            opened = &mut self.start => opened.is_ok(),
        }
    }
}

impl TransportHandle {
    /// Spawn a transport task.
    pub(crate) fn spawn<F, Fut>(cancel: CancellationToken, run: F) -> Self
    where
        F: FnOnce(TransportIo) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = oneshot::channel();
        let task = tokio::spawn(run(TransportIo {
            commands: commands_rx,
            start: start_rx,
        }));
        Self {
            commands: commands_tx,
            cancel,
            task: Some(task),
            start: Some(start_tx),
        }
    }

    /// Open the start gate. Called once, after the session is `Connected`.
    pub(crate) fn start(&mut self) {
        if let Some(start) = self.start.take() {
            let _ = start.send(());
        }
    }

    /// Queue bytes for the transport's writer.
    pub fn write(&self, bytes: Bytes) -> Result<(), SessionError> {
        self.commands
            .send(TransportCommand::Write(bytes))
            .map_err(|_| SessionError::TransportFault("transport task has exited".into()))
    }

    /// Queue a resize. Ignored if the transport has exited.
    pub fn resize(&self, size: TermSize) {
        let _ = self.commands.send(TransportCommand::Resize(size));
    }

    /// Cancel the transport and wait for its task to release resources.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "Transport task ended abnormally");
            }
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What a transport task knows about the session it serves.
pub(crate) struct TransportContext {
    pub session_id: SessionId,
    pub generation: u64,
    pub cancel: CancellationToken,
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) output: RelaySender,
}

impl TransportContext {
    /// Forward output to the relay. Returns `false` once the connection is
    /// cancelled or the relay is gone.
    pub async fn forward(&self, bytes: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.output.chunk(bytes) => sent,
        }
    }

    /// Report that the transport ended on its own.
    ///
    /// Marks the session `Disconnected`, then emits an optional informational
    /// line followed by the exit notice. Nothing is emitted if this
    /// connection has already been superseded by a disconnect or reconnect.
    pub async fn finish(self, code: Option<i32>, signal: Option<String>, note: Option<String>) {
        if !self.shared.release_if_current(self.generation) {
            debug!(
                session_id = %self.session_id,
                generation = self.generation,
                "Transport ended after its connection was superseded"
            );
            return;
        }

        tracing::info!(
            session_id = %self.session_id,
            code = ?code,
            signal = ?signal,
            "Session transport ended"
        );

        if let Some(note) = note {
            let line = format!("\r\n[nxshell] {}\r\n", note);
            self.output.chunk(Bytes::from(line)).await;
        }
        self.output.exit(code, signal).await;
    }
}

/// Run the handshake for a configuration and return the live transport.
pub(crate) async fn open(
    config: &SessionConfig,
    options: &SessionOptions,
    size: TermSize,
    ctx: TransportContext,
) -> Result<TransportHandle, SessionError> {
    match config {
        SessionConfig::Local(local) => local::open(local, options, size, ctx).await,
        SessionConfig::Ssh(ssh) => ssh::open(ssh, &options.ssh, size, ctx).await,
    }
}
