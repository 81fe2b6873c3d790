//! End-to-end integration tests for the NxShell session core.
//!
//! These tests verify complete flows work correctly:
//! - Local sessions from create through exit
//! - Input ordering and session isolation
//! - SSH handshake timeout and cancellation against a silent server
//! - Removal while output is still buffered
//! - Driving the core over a Unix socket

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol::{
    Command, ConnectionState, CreateSession, Event, Reply, SessionExit, SessionKind, SessionRef,
};
use serde_json::json;
use sessiond::config::Config;
use sessiond::events::{event_channel, EventReceiver};
use sessiond::ipc::IpcClient;
use sessiond::service::SessionService;
use sessiond::session::{RelayConfig, SessionError, SessionOptions, SessionRegistry};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn create_registry(options: SessionOptions, relay: RelayConfig) -> (Arc<SessionRegistry>, EventReceiver) {
    let (events, rx) = event_channel(1024);
    (Arc::new(SessionRegistry::new(options, relay, events)), rx)
}

fn default_registry() -> (Arc<SessionRegistry>, EventReceiver) {
    create_registry(SessionOptions::default(), RelayConfig::default())
}

async fn next_event(rx: &mut EventReceiver) -> Event {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Collect a session's output until its exit event.
async fn output_until_exit(rx: &mut EventReceiver, session_id: &str) -> (Vec<u8>, SessionExit) {
    let mut output = Vec::new();
    loop {
        match next_event(rx).await {
            Event::Data(data) if data.session_id == session_id => output.extend(data.payload),
            Event::Exit(exit) if exit.session_id == session_id => return (output, exit),
            _ => {}
        }
    }
}

/// Collect a session's output until it contains `needle`.
async fn output_until(rx: &mut EventReceiver, session_id: &str, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        if let Event::Data(data) = next_event(rx).await {
            if data.session_id == session_id {
                output.push_str(&String::from_utf8_lossy(&data.payload));
            }
        }
    }
    output
}

/// A TCP server that accepts one connection, never speaks, and reports when
/// the client closes its side.
async fn silent_server() -> (u16, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = closed_tx.send(());
    });

    (port, closed_rx)
}

fn ssh_config(port: u16) -> serde_json::Value {
    json!({
        "host": "127.0.0.1",
        "port": port,
        "username": "nobody",
        "password": "secret",
    })
}

// =============================================================================
// Local Sessions
// =============================================================================

#[tokio::test]
async fn test_local_echo_end_to_end() {
    let (registry, mut rx) = default_registry();
    let id = registry
        .create(
            SessionKind::Local,
            json!({"shellPath": "/bin/echo", "args": ["hi"]}),
        )
        .await
        .unwrap();

    registry.connect(&id).await.unwrap();
    let (output, exit) = output_until_exit(&mut rx, &id).await;

    assert!(String::from_utf8_lossy(&output).contains("hi"));
    assert_eq!(exit.code, Some(0));
    assert_eq!(exit.signal, None);

    let session = registry.get(&id).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_local_reconnect_after_exit() {
    let (registry, mut rx) = default_registry();
    let id = registry
        .create(
            SessionKind::Local,
            json!({"shell_path": "/bin/sh", "args": ["-c", "exit 3"]}),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        registry.connect(&id).await.unwrap();
        let (_, exit) = output_until_exit(&mut rx, &id).await;
        assert_eq!(exit.code, Some(3));
    }
}

#[tokio::test]
async fn test_local_signal_exit_reports_signal() {
    let (registry, mut rx) = default_registry();
    let id = registry
        .create(
            SessionKind::Local,
            json!({"shell_path": "/bin/sh", "args": ["-c", "kill -TERM $$"]}),
        )
        .await
        .unwrap();

    registry.connect(&id).await.unwrap();
    let (_, exit) = output_until_exit(&mut rx, &id).await;

    assert_eq!(exit.code, None);
    let signal = exit.signal.expect("signal death reports the signal");
    assert!(!signal.is_empty());
}

#[tokio::test]
async fn test_input_order_and_isolation() {
    let (registry, mut rx) = default_registry();
    let cat = json!({"shell_path": "/bin/cat"});
    let first = registry.create(SessionKind::Local, cat.clone()).await.unwrap();
    let second = registry.create(SessionKind::Local, cat).await.unwrap();
    registry.connect(&first).await.unwrap();
    registry.connect(&second).await.unwrap();

    for (a, b) in ["a", "b", "c"].iter().zip(["x", "y", "z"].iter()) {
        registry.input(&first, Bytes::from(*a)).await.unwrap();
        registry.input(&second, Bytes::from(*b)).await.unwrap();
    }
    registry.input(&first, Bytes::from_static(b"\n")).await.unwrap();
    registry.input(&second, Bytes::from_static(b"\n")).await.unwrap();

    let mut first_out = String::new();
    let mut second_out = String::new();
    while !(first_out.contains("abc") && second_out.contains("xyz")) {
        if let Event::Data(data) = next_event(&mut rx).await {
            let text = String::from_utf8_lossy(&data.payload).into_owned();
            if data.session_id == first {
                first_out.push_str(&text);
            } else if data.session_id == second {
                second_out.push_str(&text);
            }
        }
    }
    assert!(!first_out.contains(&['x', 'y', 'z'][..]));
    assert!(!second_out.contains(&['a', 'b', 'c'][..]));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_send_command_appends_terminator() {
    let (registry, mut rx) = default_registry();
    let id = registry
        .create(SessionKind::Local, json!({"shell_path": "/bin/sh"}))
        .await
        .unwrap();
    registry.connect(&id).await.unwrap();

    registry
        .send_command(&id, "echo nx$((40 + 2))shell")
        .await
        .unwrap();
    output_until(&mut rx, &id, "nx42shell").await;

    registry.send_command(&id, "exit 0").await.unwrap();
    let (_, exit) = output_until_exit(&mut rx, &id).await;
    assert_eq!(exit.code, Some(0));
}

#[tokio::test]
async fn test_broadcast_reaches_connected_sessions_only() {
    let (registry, mut rx) = default_registry();
    let sh = json!({"shell_path": "/bin/sh"});
    let connected = registry.create(SessionKind::Local, sh.clone()).await.unwrap();
    let idle = registry.create(SessionKind::Local, sh).await.unwrap();
    registry.connect(&connected).await.unwrap();

    assert_eq!(registry.broadcast("echo broad$((1 + 1))cast").await, 1);
    output_until(&mut rx, &connected, "broad2cast").await;

    let idle = registry.get(&idle).await.unwrap();
    assert_eq!(idle.state(), ConnectionState::Disconnected);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_emits_no_exit_event() {
    let (registry, mut rx) = default_registry();
    let id = registry
        .create(SessionKind::Local, json!({"shell_path": "/bin/cat"}))
        .await
        .unwrap();
    registry.connect(&id).await.unwrap();

    registry.disconnect(&id).await;
    registry.disconnect(&id).await;

    let deadline = tokio::time::sleep(Duration::from_millis(500));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = rx.recv() => {
                if let Some(Event::Exit(exit)) = event {
                    assert_ne!(exit.session_id, id, "explicit disconnect must not emit exit");
                }
            }
        }
    }
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test]
async fn test_remove_discards_buffered_output() {
    let relay = RelayConfig {
        max_chunks: 1000,
        max_latency: Duration::from_secs(30),
        ..RelayConfig::default()
    };
    let (registry, mut rx) = create_registry(SessionOptions::default(), relay);
    let id = registry
        .create(
            SessionKind::Local,
            json!({"shell_path": "/bin/sh", "args": ["-c", "echo pending; sleep 5"]}),
        )
        .await
        .unwrap();
    registry.connect(&id).await.unwrap();

    // Let the output reach the batcher
    tokio::time::sleep(Duration::from_millis(300)).await;
    registry.remove(&id).await.unwrap();

    let mut removed = false;
    let deadline = tokio::time::sleep(Duration::from_millis(500));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = rx.recv() => match event {
                Some(Event::Data(data)) => assert_ne!(data.session_id, id),
                Some(Event::Exit(exit)) => assert_ne!(exit.session_id, id),
                Some(Event::SessionRemoved(r)) if r.session_id == id => removed = true,
                Some(_) => {}
                None => break,
            }
        }
    }
    assert!(removed);
    assert!(registry.get(&id).await.is_none());
    assert!(!registry.relay().is_attached(&id));
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_lifecycle_changes_do_not_block_input_behind_output() {
    let (events, mut rx) = event_channel(8);
    let registry = Arc::new(SessionRegistry::new(
        SessionOptions::default(),
        RelayConfig::default(),
        events,
    ));
    let noisy = registry
        .create(SessionKind::Local, json!({"shell_path": "yes"}))
        .await
        .unwrap();
    let quiet = registry
        .create(SessionKind::Local, json!({"shell_path": "/bin/cat"}))
        .await
        .unwrap();
    registry.connect(&noisy).await.unwrap();
    registry.connect(&quiet).await.unwrap();

    // Nobody reads the stream while the noisy session fills it
    tokio::time::sleep(Duration::from_millis(300)).await;

    let bound = Duration::from_secs(1);
    assert!(tokio::time::timeout(bound, registry.switch(&quiet)).await.unwrap());
    tokio::time::timeout(bound, registry.input(&quiet, Bytes::from_static(b"k\n")))
        .await
        .expect("input stalled behind output")
        .unwrap();
    let extra = tokio::time::timeout(bound, registry.create(SessionKind::Local, json!({})))
        .await
        .expect("create stalled behind output")
        .unwrap();
    assert_eq!(registry.active_id().await, Some(quiet.clone()));
    assert_eq!(registry.list().await.len(), 3);

    // Once the consumer reads again the quiet session's echo comes through
    output_until(&mut rx, &quiet, "k").await;

    registry.remove(&extra).await.unwrap();
    registry.shutdown().await;
}

// =============================================================================
// SSH Handshake
// =============================================================================

#[tokio::test]
async fn test_ssh_handshake_timeout_releases_socket() {
    let (port, closed) = silent_server().await;
    let options = SessionOptions {
        ssh_connect_timeout: Duration::from_millis(300),
        ..SessionOptions::default()
    };
    let (registry, _rx) = create_registry(options, RelayConfig::default());
    let id = registry.create(SessionKind::Ssh, ssh_config(port)).await.unwrap();

    let started = Instant::now();
    let err = registry.connect(&id).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SessionError::HandshakeTimeout(_)), "got {}", err);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);

    let session = registry.get(&id).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);

    tokio::time::timeout(Duration::from_secs(2), closed)
        .await
        .expect("socket still open after timeout")
        .unwrap();
}

#[tokio::test]
async fn test_ssh_disconnect_aborts_handshake() {
    let (port, closed) = silent_server().await;
    let (registry, _rx) = default_registry();
    let id = registry.create(SessionKind::Ssh, ssh_config(port)).await.unwrap();

    let connecting = {
        let registry = Arc::clone(&registry);
        let id = id.clone();
        tokio::spawn(async move { registry.connect(&id).await })
    };

    let session = registry.get(&id).await.unwrap();
    while session.state() != ConnectionState::Connecting {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.disconnect(&id).await;

    let result = tokio::time::timeout(Duration::from_secs(2), connecting)
        .await
        .expect("connect did not return after disconnect")
        .unwrap();
    assert!(matches!(result, Err(SessionError::HandshakeFailed(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);

    tokio::time::timeout(Duration::from_secs(2), closed)
        .await
        .expect("socket still open after disconnect")
        .unwrap();
}

#[tokio::test]
async fn test_ssh_unreachable_host_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (registry, _rx) = default_registry();
    let id = registry.create(SessionKind::Ssh, ssh_config(port)).await.unwrap();
    let err = registry.connect(&id).await.unwrap_err();
    assert!(matches!(err, SessionError::HandshakeFailed(_)), "got {}", err);

    // The session survives a failed connect
    assert_eq!(registry.list().await.len(), 1);
}

// =============================================================================
// IPC
// =============================================================================

/// Run a `serve` daemon on `socket` until the returned token is cancelled.
fn start_service(socket: &Path) -> (JoinHandle<anyhow::Result<()>>, CancellationToken) {
    let service = SessionService::new(&Config::default());
    let stop = CancellationToken::new();
    let serving = {
        let socket = socket.to_path_buf();
        let stop = stop.clone();
        tokio::spawn(async move {
            service
                .run_serve(&socket, async move { stop.cancelled().await })
                .await
        })
    };
    (serving, stop)
}

/// Connect once the daemon is listening.
async fn connect_client(socket: &Path) -> IpcClient {
    loop {
        match IpcClient::connect(socket).await {
            Ok(client) => return client,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}

async fn create_over_ipc(client: &mut IpcClient, config: serde_json::Value) -> String {
    match client
        .request(Command::Create(CreateSession {
            kind: SessionKind::Local,
            config,
        }))
        .await
        .unwrap()
    {
        Reply::Created { session_id } => session_id,
        other => panic!("unexpected reply: {:?}", other),
    }
}

/// Read events until the session's output contains `needle`.
async fn ipc_output_until(client: &mut IpcClient, session_id: &str, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        if let Event::Data(data) = client.next_event().await.unwrap() {
            if data.session_id == session_id {
                output.push_str(&String::from_utf8_lossy(&data.payload));
            }
        }
    }
    output
}

#[tokio::test]
async fn test_ipc_local_session_flow() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("sessiond.sock");
    let (serving, stop) = start_service(&socket);
    let mut client = connect_client(&socket).await;

    let session_id = create_over_ipc(
        &mut client,
        json!({"shellPath": "/bin/echo", "args": ["over-ipc"]}),
    )
    .await;

    let reply = client
        .request(Command::Connect(SessionRef::new(&session_id)))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Ack);

    let mut output = Vec::new();
    let exit = loop {
        match client.next_event().await.unwrap() {
            Event::Data(data) if data.session_id == session_id => output.extend(data.payload),
            Event::Exit(exit) if exit.session_id == session_id => break exit,
            _ => {}
        }
    };
    assert!(String::from_utf8_lossy(&output).contains("over-ipc"));
    assert_eq!(exit.code, Some(0));

    let err = client
        .request(Command::Connect(SessionRef::new("missing")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing"));

    drop(client);
    stop.cancel();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_ipc_input_after_consumer_reconnects() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("sessiond.sock");
    let (serving, stop) = start_service(&socket);

    // First consumer types into a session, pushing its input ids well past 1
    let mut first = connect_client(&socket).await;
    first.set_timeout(EVENT_TIMEOUT);
    let session_id = create_over_ipc(&mut first, json!({"shell_path": "/bin/cat"})).await;
    first
        .request(Command::Connect(SessionRef::new(&session_id)))
        .await
        .unwrap();
    for _ in 0..5 {
        first.send_input(&session_id, b"one").await.unwrap();
    }
    first.send_input(&session_id, b"\n").await.unwrap();
    ipc_output_until(&mut first, &session_id, "oneoneoneoneone").await;
    drop(first);

    // A new consumer numbers its requests from 1 again
    let mut second = connect_client(&socket).await;
    second.set_timeout(EVENT_TIMEOUT);
    second.send_input(&session_id, b"hello\n").await.unwrap();
    ipc_output_until(&mut second, &session_id, "hello").await;

    let sessions = second.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, ConnectionState::Connected);

    drop(second);
    stop.cancel();
    serving.await.unwrap().unwrap();
}
