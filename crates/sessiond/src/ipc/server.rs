//! IPC server side: socket listener and consumer connections.
//!
//! A connection reads newline-delimited [`Request`]s and writes
//! [`ServerMessage`]s. The same connection type serves a Unix socket stream
//! or the process's stdin/stdout.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::{Command, ProtocolError, Request, Response, ServerMessage};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::events::EventReceiver;
use crate::router::{self, CommandRouter, InputDedup, RouterError};

/// A consumer connection over a Unix socket stream.
pub type UnixConnection = IpcConnection<ReadHalf<UnixStream>, WriteHalf<UnixStream>>;

/// A server that listens for consumer connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created and a stale socket file at the path is
    /// removed first.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<UnixConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(IpcConnection::new(read_half, write_half))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A consumer connection speaking newline-delimited JSON.
pub struct IpcConnection<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> IpcConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Read the next request, skipping blank lines.
    ///
    /// Returns `None` once the consumer has closed its side.
    pub async fn read_request(&mut self) -> Result<Option<Request>, IpcError> {
        read_request(&mut self.reader).await
    }

    /// Write one message as a JSON line.
    pub async fn send(&mut self, message: &ServerMessage) -> Result<(), IpcError> {
        write_message(&mut self.writer, message).await
    }

    /// Serve the consumer until it disconnects.
    ///
    /// Sends `Hello`, then runs two halves concurrently: the reader routes
    /// requests while the writer merges responses with the event stream.
    /// Duplicate input is filtered against this connection's request ids.
    /// Events keep draining while a command is being routed, so a registry
    /// call that publishes an event can never wait on this connection.
    pub async fn serve(
        self,
        router: Arc<CommandRouter>,
        events: &mut EventReceiver,
    ) -> Result<(), IpcError> {
        let Self { mut reader, mut writer } = self;
        let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();

        let reading = read_loop(&mut reader, &router, responses_tx);
        let writing = write_loop(&mut writer, &mut responses_rx, events);

        tokio::select! {
            result = reading => {
                debug!("Consumer closed the connection");
                result
            }
            result = writing => result,
        }
    }
}

/// Next non-blank line, trimmed. `None` at end of stream.
async fn read_line<R>(reader: &mut BufReader<R>) -> Result<Option<String>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}

async fn read_request<R>(reader: &mut BufReader<R>) -> Result<Option<Request>, IpcError>
where
    R: AsyncRead + Unpin,
{
    match read_line(reader).await? {
        Some(line) => Ok(Some(Request::from_json(&line)?)),
        None => Ok(None),
    }
}

/// The `id` of a line that failed to parse as a request, if it has one.
fn recover_request_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}

async fn write_message<W>(writer: &mut W, message: &ServerMessage) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut json = message.to_json()?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop<R>(
    reader: &mut BufReader<R>,
    router: &Arc<CommandRouter>,
    responses: mpsc::UnboundedSender<Response>,
) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut dedup = InputDedup::new();

    loop {
        let Some(line) = read_line(reader).await? else {
            return Ok(());
        };
        let request = match Request::from_json(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                // Answer when the consumer can correlate the error
                if let Some(id) = recover_request_id(&line) {
                    let error = RouterError::Protocol(e).to_error_message(None);
                    let _ = responses.send(Response::error(id, error));
                }
                continue;
            }
        };

        if let Command::Input(input) = &request.command {
            if !dedup.accept(&input.session_id, request.id) {
                debug!(session_id = %input.session_id, request_id = request.id, "Dropping duplicate input");
                continue;
            }
        }

        if router::is_slow(&request.command) {
            let router = Arc::clone(router);
            let responses = responses.clone();
            tokio::spawn(async move {
                if let Some(response) = router.route(request).await {
                    let _ = responses.send(response);
                }
            });
        } else if let Some(response) = router.route(request).await {
            let _ = responses.send(response);
        }
    }
}

async fn write_loop<W>(
    writer: &mut W,
    responses: &mut mpsc::UnboundedReceiver<Response>,
    events: &mut EventReceiver,
) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, &ServerMessage::hello()).await?;

    loop {
        let message = tokio::select! {
            Some(response) = responses.recv() => ServerMessage::Response(response),
            event = events.recv() => match event {
                Some(event) => ServerMessage::Event(event),
                None => {
                    debug!("Event stream closed");
                    return Ok(());
                }
            },
        };
        trace!(?message, "Writing message");
        write_message(writer, &message).await?;
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// The daemon answered with an error.
    #[error("request failed: {0}")]
    Remote(String),

    /// The daemon answered with a reply of the wrong shape.
    #[error("unexpected reply")]
    UnexpectedReply,
}
