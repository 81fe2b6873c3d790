//! Output batching relay.
//!
//! Transports push output chunks into a per-session batcher task. The batcher
//! coalesces them and delivers one [`Event::Data`] when either the chunk count
//! reaches [`RelayConfig::max_chunks`] or [`RelayConfig::max_latency`] has
//! elapsed since the first unflushed chunk, whichever comes first. Within one
//! session batches preserve byte order and nothing is dropped.
//!
//! Detaching a session cancels its batcher and discards whatever is still
//! buffered; no `Data` event for that session is emitted afterwards.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use protocol::{Event, SessionData, SessionExit};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::SessionId;
use crate::events::EventSender;

/// Default chunk count that forces a flush.
pub const DEFAULT_MAX_CHUNKS: usize = 10;

/// Default latency bound (about one frame at 60Hz).
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(16);

/// Default per-session queue capacity between a transport and its batcher.
pub const DEFAULT_INPUT_CAPACITY: usize = 64;

/// Batching parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Flush once this many chunks are buffered.
    pub max_chunks: usize,
    /// Flush this long after the first unflushed chunk.
    pub max_latency: Duration,
    /// Capacity of each session's input queue.
    pub input_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            max_latency: DEFAULT_MAX_LATENCY,
            input_capacity: DEFAULT_INPUT_CAPACITY,
        }
    }
}

/// What a transport hands to its batcher.
#[derive(Debug)]
pub enum RelayInput {
    /// A chunk of output bytes.
    Chunk(Bytes),
    /// The transport ended. Buffered output is flushed before the exit event.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}

/// Sending half handed to a session's transport.
#[derive(Debug, Clone)]
pub struct RelaySender {
    session_id: SessionId,
    tx: mpsc::Sender<RelayInput>,
}

impl RelaySender {
    pub fn new(session_id: SessionId, tx: mpsc::Sender<RelayInput>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue a chunk. Returns `false` once the batcher is gone.
    pub async fn chunk(&self, bytes: Bytes) -> bool {
        self.tx.send(RelayInput::Chunk(bytes)).await.is_ok()
    }

    /// Queue the terminal exit notice.
    pub async fn exit(&self, code: Option<i32>, signal: Option<String>) -> bool {
        self.tx.send(RelayInput::Exit { code, signal }).await.is_ok()
    }
}

struct BatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of every session's batcher task.
pub struct OutputRelay {
    config: RelayConfig,
    events: EventSender,
    batchers: DashMap<SessionId, BatcherHandle>,
}

impl OutputRelay {
    pub fn new(config: RelayConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            batchers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start a batcher for a session and return the sender its transport uses.
    ///
    /// Attaching an id that already has a batcher replaces it; the old one is
    /// cancelled and its buffer discarded.
    pub fn attach(&self, session_id: &str) -> RelaySender {
        let (tx, rx) = mpsc::channel(self.config.input_capacity.max(1));
        let cancel = CancellationToken::new();
        let batcher = Batcher {
            session_id: session_id.to_string(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            pending: Vec::with_capacity(self.config.max_chunks),
        };
        let task = tokio::spawn(batcher.run(rx));

        if let Some(previous) = self
            .batchers
            .insert(session_id.to_string(), BatcherHandle { cancel, task })
        {
            previous.cancel.cancel();
        }

        debug!(session_id = %session_id, "Output relay attached");
        RelaySender::new(session_id.to_string(), tx)
    }

    /// Stop a session's batcher, discarding buffered output.
    ///
    /// Returns once the batcher task has finished, so no `Data` event for the
    /// session can be emitted after this returns.
    pub async fn detach(&self, session_id: &str) -> bool {
        let Some((_, handle)) = self.batchers.remove(session_id) else {
            return false;
        };
        handle.cancel.cancel();
        let _ = handle.task.await;
        debug!(session_id = %session_id, "Output relay detached");
        true
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.batchers.contains_key(session_id)
    }

    pub fn attached_count(&self) -> usize {
        self.batchers.len()
    }

    /// Detach every batcher.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.batchers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.detach(&id).await;
        }
    }
}

struct Batcher {
    session_id: SessionId,
    config: RelayConfig,
    events: EventSender,
    cancel: CancellationToken,
    pending: Vec<Bytes>,
}

impl Batcher {
    async fn run(mut self, mut rx: mpsc::Receiver<RelayInput>) {
        let deadline = tokio::time::sleep(self.config.max_latency);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    trace!(
                        session_id = %self.session_id,
                        discarded = self.pending.len(),
                        "Batcher cancelled"
                    );
                    return;
                }

                _ = &mut deadline, if !self.pending.is_empty() => {
                    if !self.flush().await {
                        return;
                    }
                }

                input = rx.recv() => match input {
                    Some(RelayInput::Chunk(bytes)) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        if self.pending.is_empty() {
                            deadline.as_mut().reset(Instant::now() + self.config.max_latency);
                        }
                        self.pending.push(bytes);
                        if self.pending.len() >= self.config.max_chunks && !self.flush().await {
                            return;
                        }
                    }
                    Some(RelayInput::Exit { code, signal }) => {
                        if !self.flush().await {
                            return;
                        }
                        let exit = Event::Exit(SessionExit {
                            session_id: self.session_id.clone(),
                            code,
                            signal,
                        });
                        if !self.deliver(exit).await {
                            return;
                        }
                    }
                    None => {
                        self.flush().await;
                        return;
                    }
                },
            }
        }
    }

    /// Deliver buffered chunks as one event. Returns `false` when the batcher
    /// should stop.
    async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }

        let total: usize = self.pending.iter().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total);
        for chunk in self.pending.drain(..) {
            payload.extend_from_slice(&chunk);
        }

        trace!(session_id = %self.session_id, bytes = total, "Flushing output batch");
        self.deliver(Event::Data(SessionData {
            session_id: self.session_id.clone(),
            payload: payload.to_vec(),
        }))
        .await
    }

    async fn deliver(&self, event: Event) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, EventReceiver};

    fn relay_with(config: RelayConfig) -> (OutputRelay, EventReceiver) {
        let (tx, rx) = event_channel(64);
        (OutputRelay::new(config, tx), rx)
    }

    fn data_payload(event: Event) -> Vec<u8> {
        match event {
            Event::Data(data) => data.payload,
            other => panic!("expected data event, got {:?}", other),
        }
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.max_chunks, 10);
        assert_eq!(config.max_latency, Duration::from_millis(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifteen_chunks_make_two_batches() {
        let (relay, mut rx) = relay_with(RelayConfig::default());
        let sender = relay.attach("s1");

        for i in 0..15u8 {
            assert!(sender.chunk(Bytes::from(vec![b'a' + i])).await);
        }

        let first = data_payload(rx.recv().await.unwrap());
        assert_eq!(first, b"abcdefghij");

        let second = data_payload(rx.recv().await.unwrap());
        assert_eq!(second, b"klmno");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_flush_after_first_chunk() {
        let (relay, mut rx) = relay_with(RelayConfig::default());
        let sender = relay.attach("s1");
        let started = Instant::now();

        sender.chunk(Bytes::from_static(b"hi")).await;
        let payload = data_payload(rx.recv().await.unwrap());

        assert_eq!(payload, b"hi");
        assert!(started.elapsed() >= Duration::from_millis(16));
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_follows_flushed_output() {
        let (relay, mut rx) = relay_with(RelayConfig::default());
        let sender = relay.attach("s1");

        sender.chunk(Bytes::from_static(b"bye\r\n")).await;
        sender.exit(Some(0), None).await;

        assert_eq!(data_payload(rx.recv().await.unwrap()), b"bye\r\n");
        match rx.recv().await.unwrap() {
            Event::Exit(exit) => {
                assert_eq!(exit.session_id, "s1");
                assert_eq!(exit.code, Some(0));
                assert!(exit.signal.is_none());
            }
            other => panic!("expected exit event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_discards_pending_output() {
        let (relay, mut rx) = relay_with(RelayConfig::default());
        let sender = relay.attach("s1");

        sender.chunk(Bytes::from_static(b"pending")).await;
        tokio::task::yield_now().await;
        assert!(relay.detach("s1").await);
        assert!(!relay.is_attached("s1"));

        // Past the point where the latency timer would have fired
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(!sender.chunk(Bytes::from_static(b"late")).await);
    }

    #[tokio::test]
    async fn test_detach_unknown_session() {
        let (relay, _rx) = relay_with(RelayConfig::default());
        assert!(!relay.detach("missing").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_batch_independently() {
        let (relay, mut rx) = relay_with(RelayConfig {
            max_chunks: 2,
            ..RelayConfig::default()
        });
        let a = relay.attach("a");
        let b = relay.attach("b");

        a.chunk(Bytes::from_static(b"1")).await;
        b.chunk(Bytes::from_static(b"x")).await;
        a.chunk(Bytes::from_static(b"2")).await;

        match rx.recv().await.unwrap() {
            Event::Data(data) => {
                assert_eq!(data.session_id, "a");
                assert_eq!(data.payload, b"12");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Event::Data(data) => {
                assert_eq!(data.session_id, "b");
                assert_eq!(data.payload, b"x");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_detaches_all() {
        let (relay, _rx) = relay_with(RelayConfig::default());
        relay.attach("a");
        relay.attach("b");
        assert_eq!(relay.attached_count(), 2);

        relay.shutdown().await;
        assert_eq!(relay.attached_count(), 0);
    }
}
