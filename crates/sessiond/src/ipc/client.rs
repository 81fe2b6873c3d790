//! IPC client for talking to a running `serve` daemon.
//!
//! Requests are numbered by the client. While waiting for a response, any
//! events that arrive first are buffered and can be read later with
//! [`IpcClient::next_event`].

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{
    Command, Event, Input, Outcome, Reply, Request, Response, ServerMessage, SessionSummary,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
    next_id: u64,
    events: VecDeque<Event>,
    server_version: Option<u8>,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect with a custom timeout, used for connecting and for every
    /// later request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
            next_id: 1,
            events: VecDeque::new(),
            server_version: None,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Protocol version announced by the daemon, once its hello was read.
    pub fn server_version(&self) -> Option<u8> {
        self.server_version
    }

    async fn write_request(&mut self, command: Command) -> Result<u64, IpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut json = Request::new(id, command).to_json()?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(id)
    }

    async fn read_message(&mut self) -> Result<ServerMessage, IpcError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(IpcError::Closed);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(ServerMessage::from_json(trimmed)?);
            }
        }
    }

    async fn wait_for_response(&mut self, id: u64) -> Result<Response, IpcError> {
        loop {
            match self.read_message().await? {
                ServerMessage::Response(response) if response.id == id => return Ok(response),
                ServerMessage::Response(response) => {
                    debug!(id = response.id, "Discarding response to an earlier request");
                }
                ServerMessage::Event(event) => self.events.push_back(event),
                ServerMessage::Hello { version } => self.server_version = Some(version),
            }
        }
    }

    /// Send a command and wait for its response.
    pub async fn send(&mut self, command: Command) -> Result<Response, IpcError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, async {
            let id = self.write_request(command).await?;
            self.wait_for_response(id).await
        })
        .await
        .map_err(|_| IpcError::Timeout)?
    }

    /// Send a command and unwrap a successful reply.
    pub async fn request(&mut self, command: Command) -> Result<Reply, IpcError> {
        match self.send(command).await?.result {
            Outcome::Ok(reply) => Ok(reply),
            Outcome::Error(e) => Err(IpcError::Remote(e.message)),
        }
    }

    /// Forward raw input. The daemon never answers input.
    pub async fn send_input(&mut self, session_id: &str, data: &[u8]) -> Result<(), IpcError> {
        self.write_request(Command::Input(Input {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        }))
        .await
        .map(|_| ())
    }

    /// Next event, buffered or read from the socket.
    pub async fn next_event(&mut self) -> Result<Event, IpcError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        let timeout = self.timeout;
        tokio::time::timeout(timeout, async {
            loop {
                match self.read_message().await? {
                    ServerMessage::Event(event) => return Ok(event),
                    ServerMessage::Hello { version } => self.server_version = Some(version),
                    ServerMessage::Response(response) => {
                        debug!(id = response.id, "Discarding unsolicited response");
                    }
                }
            }
        })
        .await
        .map_err(|_| IpcError::Timeout)?
    }

    /// List all sessions tracked by the daemon.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSummary>, IpcError> {
        match self.request(Command::ListSessions).await? {
            Reply::Sessions(sessions) => Ok(sessions),
            _ => Err(IpcError::UnexpectedReply),
        }
    }
}
