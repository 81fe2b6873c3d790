//! The single consumer-facing event stream.
//!
//! Lifecycle events from the registry and batched output from the relay all
//! flow through one bounded channel, so a slow consumer applies backpressure
//! instead of growing memory without limit.
//!
//! Only output is throttled that way. Lifecycle events go through a
//! [`LifecycleQueue`] that never blocks its caller, so a registry mutation
//! cannot stall command intake behind a backlog of `Data` events.

use parking_lot::Mutex;
use protocol::Event;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Create the event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Discard events until the sender side closes.
///
/// Used while no consumer is attached so producers never block forever.
pub async fn drain(mut events: EventReceiver) {
    let mut dropped = 0usize;
    while let Some(event) = events.recv().await {
        dropped += 1;
        trace!(
            session_id = event.session_id().unwrap_or("-"),
            "Dropping event with no consumer attached"
        );
    }
    debug!(dropped, "Event stream closed");
}

/// Non-blocking entry point for lifecycle events.
///
/// Events are queued without bound and forwarded, in push order, into the
/// bounded stream by one task. The task is started by the first push, so the
/// queue can be built outside a runtime.
pub struct LifecycleQueue {
    tx: mpsc::UnboundedSender<Event>,
    idle: Mutex<Option<(mpsc::UnboundedReceiver<Event>, EventSender)>>,
}

impl LifecycleQueue {
    pub fn new(events: EventSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            idle: Mutex::new(Some((rx, events))),
        }
    }

    /// Queue an event. Must be called from within a tokio runtime.
    pub fn push(&self, event: Event) {
        if let Some((rx, events)) = self.idle.lock().take() {
            tokio::spawn(forward(rx, events));
        }
        if self.tx.send(event).is_err() {
            debug!("Lifecycle forwarder gone, dropping event");
        }
    }
}

async fn forward(mut queue: mpsc::UnboundedReceiver<Event>, events: EventSender) {
    while let Some(event) = queue.recv().await {
        if events.send(event).await.is_err() {
            debug!("Event stream closed, stopping lifecycle forwarder");
            return;
        }
    }
}
