//! Local pseudo-terminal transport.
//!
//! Spawns the configured shell under a pty. Three helpers run beside the
//! transport task: a blocking reader feeding a bounded queue, a blocking
//! waiter reporting the exit status, and a writer task applying input in
//! order.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use protocol::LocalConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{TransportCommand, TransportContext, TransportHandle, TransportIo};
use crate::session::{SessionError, SessionId, SessionOptions, TermSize};

/// Buffer size for reading from the pty.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks queued between the reader thread and the transport task.
const OUTPUT_QUEUE_CAPACITY: usize = 64;

/// Output is still drained for this long after the child exits.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// TERM used when neither the parent nor the config provides one.
const DEFAULT_TERM: &str = "xterm-256color";

struct LocalPty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl LocalPty {
    /// Kill the child and reap it off the async runtime.
    fn terminate(self) {
        let LocalPty {
            mut child,
            mut killer,
            ..
        } = self;
        let _ = killer.kill();
        tokio::task::spawn_blocking(move || {
            let _ = child.wait();
        });
    }
}

/// Split an exit status into `(code, signal)`.
///
/// portable-pty records a signal death as a failure with code 1 and only
/// exposes the signal name through `Display`.
fn exit_details(status: &ExitStatus) -> (Option<i32>, Option<String>) {
    if !status.success() {
        let text = status.to_string();
        if let Some(signal) = text.strip_prefix("Terminated by ") {
            return (None, Some(signal.to_string()));
        }
    }
    (Some(status.exit_code() as i32), None)
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_pty(
    program: &str,
    args: &[String],
    cwd: Option<PathBuf>,
    env: &BTreeMap<String, String>,
    size: TermSize,
) -> Result<LocalPty, SessionError> {
    let pair = native_pty_system()
        .openpty(pty_size(size))
        .map_err(|e| SessionError::HandshakeFailed(format!("failed to open pty: {}", e)))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    if std::env::var_os("TERM").is_none() && !env.contains_key("TERM") {
        cmd.env("TERM", DEFAULT_TERM);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = pair.slave.spawn_command(cmd).map_err(|e| {
        SessionError::HandshakeFailed(format!("failed to spawn {}: {}", program, e))
    })?;
    // Only the child may hold the slave, or the reader never sees EOF
    drop(pair.slave);

    let mut killer = child.clone_killer();
    let io = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    let (reader, writer) = match io {
        Ok(io) => io,
        Err(e) => {
            let _ = killer.kill();
            return Err(SessionError::HandshakeFailed(format!(
                "failed to attach to pty: {}",
                e
            )));
        }
    };

    Ok(LocalPty {
        master: pair.master,
        child,
        killer,
        reader,
        writer,
    })
}

/// Spawn the local process and start its transport task.
pub(crate) async fn open(
    config: &LocalConfig,
    options: &SessionOptions,
    size: TermSize,
    ctx: TransportContext,
) -> Result<TransportHandle, SessionError> {
    let program = config
        .shell_path
        .clone()
        .unwrap_or_else(|| options.default_shell.clone());
    let args = config.args.clone();
    let cwd = config.cwd.as_ref().map(PathBuf::from).or_else(dirs::home_dir);
    let env = config.env.clone();

    let spawn_program = program.clone();
    let pty = tokio::task::spawn_blocking(move || spawn_pty(&spawn_program, &args, cwd, &env, size))
        .await
        .map_err(|e| SessionError::HandshakeFailed(format!("spawn task failed: {}", e)))??;

    if ctx.cancel.is_cancelled() {
        pty.terminate();
        return Err(SessionError::HandshakeFailed("connect cancelled".into()));
    }

    info!(
        session_id = %ctx.session_id,
        program = %program,
        pid = ?pty.child.process_id(),
        cols = size.cols,
        rows = size.rows,
        "Local process spawned"
    );

    let cancel = ctx.cancel.clone();
    Ok(TransportHandle::spawn(cancel, move |io| run(pty, ctx, io)))
}

async fn run(pty: LocalPty, ctx: TransportContext, mut io: TransportIo) {
    let LocalPty {
        master,
        mut child,
        mut killer,
        reader,
        writer,
    } = pty;

    let (output_tx, mut output_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
    tokio::task::spawn_blocking(move || read_loop(reader, output_tx));

    let (exit_tx, mut exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = exit_tx.send(child.wait());
    });

    let (write_tx, write_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, write_rx, ctx.session_id.clone()));

    if !io.wait_for_start(&ctx.cancel).await {
        let _ = killer.kill();
        return;
    }

    let mut exit: Option<(Option<i32>, Option<String>)> = None;
    let mut output_open = true;
    let drain = tokio::time::sleep(EXIT_DRAIN_GRACE);
    tokio::pin!(drain);

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                let _ = killer.kill();
                debug!(session_id = %ctx.session_id, "Local transport cancelled");
                return;
            }

            command = io.commands.recv() => match command {
                Some(TransportCommand::Write(bytes)) => {
                    let _ = write_tx.send(bytes);
                }
                Some(TransportCommand::Resize(size)) => {
                    if let Err(e) = master.resize(pty_size(size)) {
                        debug!(session_id = %ctx.session_id, error = %e, "Failed to resize pty");
                    }
                }
                None => {
                    let _ = killer.kill();
                    return;
                }
            },

            chunk = output_rx.recv(), if output_open => match chunk {
                Some(bytes) => {
                    if !ctx.forward(bytes).await {
                        let _ = killer.kill();
                        return;
                    }
                }
                None => output_open = false,
            },

            status = &mut exit_rx, if exit.is_none() => {
                let details = match status {
                    Ok(Ok(status)) => exit_details(&status),
                    Ok(Err(e)) => {
                        warn!(session_id = %ctx.session_id, error = %e, "Failed to wait for child");
                        (None, None)
                    }
                    Err(_) => (None, None),
                };
                exit = Some(details);
                drain.as_mut().reset(Instant::now() + EXIT_DRAIN_GRACE);
            }

            _ = &mut drain, if exit.is_some() && output_open => {
                debug!(session_id = %ctx.session_id, "Pty still open after exit, stopping drain");
                output_open = false;
            }
        }

        if exit.is_some() && !output_open {
            break;
        }
    }

    drop(write_tx);
    drop(master);
    let (code, signal) = exit.unwrap_or_default();
    ctx.finish(code, signal, None).await;
}

fn read_loop(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // EIO once every slave descriptor is closed
            Err(_) => break,
        }
    }
}

async fn write_loop(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Bytes>,
    session_id: SessionId,
) {
    while let Some(bytes) = input.recv().await {
        let written = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&bytes).and_then(|()| writer.flush());
            (writer, result)
        })
        .await;

        match written {
            Ok((returned, Ok(()))) => writer = returned,
            Ok((_, Err(e))) => {
                warn!(session_id = %session_id, error = %e, "Failed to write to pty");
                break;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Pty writer task failed");
                break;
            }
        }
    }
}
