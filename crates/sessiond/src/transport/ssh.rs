//! SSH transport.
//!
//! Connects, authenticates with a password or private key, then opens an
//! interactive shell channel with a pty. Handshake failures are returned to
//! the connect caller; once the channel is open, a remote close or network
//! drop ends the session through [`TransportContext::finish`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use protocol::{SshAuth, SshConfig};
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect};
use russh_keys::key;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{TransportCommand, TransportContext, TransportHandle, TransportIo};
use crate::session::{SessionError, SessionId, SshOptions, TermSize};

/// Strip the optional `SHA256:` prefix so fingerprints compare by digest.
fn normalize_fingerprint(fingerprint: &str) -> &str {
    let trimmed = fingerprint.trim();
    trimmed.strip_prefix("SHA256:").unwrap_or(trimmed)
}

struct ClientHandler {
    session_id: SessionId,
    expected_fingerprint: Option<String>,
    presented_fingerprint: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        *self.presented_fingerprint.lock() = Some(fingerprint.clone());

        match &self.expected_fingerprint {
            Some(expected) => {
                let matches = normalize_fingerprint(expected) == normalize_fingerprint(&fingerprint);
                if !matches {
                    warn!(
                        session_id = %self.session_id,
                        presented = %fingerprint,
                        "SSH host key does not match the configured fingerprint"
                    );
                }
                Ok(matches)
            }
            None => {
                info!(
                    session_id = %self.session_id,
                    fingerprint = %fingerprint,
                    "Accepting SSH host key"
                );
                Ok(true)
            }
        }
    }
}

fn handshake_error(stage: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::HandshakeFailed(format!("{}: {}", stage, err))
}

async fn handshake(
    config: &SshConfig,
    options: &SshOptions,
    size: TermSize,
    session_id: &str,
) -> Result<(Handle<ClientHandler>, Channel<Msg>), SessionError> {
    let client_config = Arc::new(client::Config {
        inactivity_timeout: options.inactivity_timeout,
        keepalive_interval: options.keepalive_interval,
        ..Default::default()
    });

    let presented = Arc::new(Mutex::new(None));
    let handler = ClientHandler {
        session_id: session_id.to_string(),
        expected_fingerprint: config.host_key_fingerprint.clone(),
        presented_fingerprint: Arc::clone(&presented),
    };

    let mut handle = client::connect(client_config, (config.host.as_str(), config.port), handler)
        .await
        .map_err(|e| match (&config.host_key_fingerprint, presented.lock().clone()) {
            (Some(expected), Some(got))
                if normalize_fingerprint(expected) != normalize_fingerprint(&got) =>
            {
                SessionError::HandshakeFailed(format!(
                    "host key mismatch: server presented SHA256:{}",
                    normalize_fingerprint(&got)
                ))
            }
            _ => handshake_error(&format!("connect to {}:{}", config.host, config.port), e),
        })?;

    let authenticated = match &config.auth {
        SshAuth::Password(password) => {
            handle
                .authenticate_password(config.username.as_str(), password.as_str())
                .await
        }
        SshAuth::PrivateKey { key, passphrase } => {
            let key_pair = russh_keys::decode_secret_key(key, passphrase.as_deref())
                .map_err(|e| handshake_error("invalid private key", e))?;
            handle
                .authenticate_publickey(config.username.as_str(), Arc::new(key_pair))
                .await
        }
    }
    .map_err(|e| handshake_error("authentication", e))?;

    if !authenticated {
        return Err(SessionError::HandshakeFailed(format!(
            "authentication rejected for user {}",
            config.username
        )));
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| handshake_error("open channel", e))?;
    channel
        .request_pty(
            false,
            &options.term,
            u32::from(size.cols),
            u32::from(size.rows),
            0,
            0,
            &[],
        )
        .await
        .map_err(|e| handshake_error("request pty", e))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| handshake_error("request shell", e))?;

    Ok((handle, channel))
}

/// Connect, authenticate and open the shell channel, then start the
/// transport task.
pub(crate) async fn open(
    config: &SshConfig,
    options: &SshOptions,
    size: TermSize,
    ctx: TransportContext,
) -> Result<TransportHandle, SessionError> {
    info!(
        session_id = %ctx.session_id,
        host = %config.host,
        port = config.port,
        username = %config.username,
        "Opening SSH connection"
    );

    // Dropping the handshake future closes the socket
    let (handle, channel) = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            return Err(SessionError::HandshakeFailed("connect cancelled".into()));
        }
        result = handshake(config, options, size, &ctx.session_id) => result?,
    };

    info!(session_id = %ctx.session_id, "SSH shell channel open");
    let cancel = ctx.cancel.clone();
    Ok(TransportHandle::spawn(cancel, move |io| {
        run(handle, channel, ctx, io)
    }))
}

async fn close(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(error = %e, "SSH disconnect failed");
    }
}

async fn run(
    handle: Handle<ClientHandler>,
    mut channel: Channel<Msg>,
    ctx: TransportContext,
    mut io: TransportIo,
) {
    let handle = Arc::new(handle);
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(
        Arc::clone(&handle),
        channel.id(),
        write_rx,
        ctx.session_id.clone(),
    ));

    if !io.wait_for_start(&ctx.cancel).await {
        close(&handle).await;
        return;
    }

    let mut code = None;
    let mut signal = None;

    let note = loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                drop(write_tx);
                close(&handle).await;
                debug!(session_id = %ctx.session_id, "SSH transport cancelled");
                return;
            }

            command = io.commands.recv() => match command {
                Some(TransportCommand::Write(bytes)) => {
                    let _ = write_tx.send(bytes);
                }
                Some(TransportCommand::Resize(size)) => {
                    if let Err(e) = channel
                        .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                        .await
                    {
                        debug!(session_id = %ctx.session_id, error = %e, "SSH window change failed");
                    }
                }
                None => {
                    close(&handle).await;
                    return;
                }
            },

            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if !ctx.forward(Bytes::copy_from_slice(&data)).await {
                        close(&handle).await;
                        return;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    code = Some(exit_status as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, error_message, .. }) => {
                    if !error_message.is_empty() {
                        debug!(session_id = %ctx.session_id, error = %error_message, "Remote process killed");
                    }
                    signal = Some(format!("{:?}", signal_name));
                }
                Some(ChannelMsg::Eof) => {
                    debug!(session_id = %ctx.session_id, "SSH channel EOF");
                }
                Some(ChannelMsg::Close) => {
                    break (code.is_none() && signal.is_none())
                        .then(|| "remote channel closed".to_string());
                }
                None => {
                    break (code.is_none() && signal.is_none())
                        .then(|| "connection closed by remote host".to_string());
                }
                Some(_) => {}
            },
        }
    };

    drop(write_tx);
    close(&handle).await;
    ctx.finish(code, signal, note).await;
}

async fn write_loop(
    handle: Arc<Handle<ClientHandler>>,
    channel: ChannelId,
    mut input: mpsc::UnboundedReceiver<Bytes>,
    session_id: SessionId,
) {
    while let Some(bytes) = input.recv().await {
        if handle
            .data(channel, CryptoVec::from_slice(&bytes))
            .await
            .is_err()
        {
            warn!(session_id = %session_id, "SSH channel rejected input");
            break;
        }
    }
}
