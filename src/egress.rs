//! The cloud egress queue collaborator.
//!
//! Treated as infallible and fire-and-forget: `enqueue` never returns
//! an error to the caller. Modeled on the fire-and-forget
//! `EventSender::update_sync` pattern in the `drogue-opcua-agent` example,
//! adapted to a `tokio` channel instead of `futures::channel`.

use tokio::sync::mpsc::{self, UnboundedSender};

/// A sink that accepts encoded notification envelopes for upload.
pub trait EgressQueue: Send + Sync {
    fn enqueue(&self, envelope: String);
}

/// Backs the queue with an unbounded channel; a companion task drains it
/// toward the actual cloud transport (HTTP, MQTT, ...), which this
/// crate does not implement.
pub struct TokioChannelEgressQueue {
    sender: UnboundedSender<String>,
}

impl TokioChannelEgressQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EgressQueue for TokioChannelEgressQueue {
    fn enqueue(&self, envelope: String) {
        if let Err(e) = self.sender.send(envelope) {
            tracing::warn!(error = %e, "egress queue receiver dropped, notification lost");
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::EgressQueue;
    use std::sync::Mutex;

    /// Records every enqueued envelope for assertions in tests.
    #[derive(Default)]
    pub struct RecordingEgressQueue {
        envelopes: Mutex<Vec<String>>,
    }

    impl RecordingEgressQueue {
        pub fn drain(&self) -> Vec<String> {
            std::mem::take(&mut self.envelopes.lock().unwrap())
        }

        pub fn len(&self) -> usize {
            self.envelopes.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl EgressQueue for RecordingEgressQueue {
        fn enqueue(&self, envelope: String) {
            self.envelopes.lock().unwrap().push(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_delivers_through_channel() {
        let (queue, mut rx) = TokioChannelEgressQueue::new();
        queue.enqueue("hello".to_string());
        assert_eq!(rx.recv().await, Some("hello".to_string()));
    }
}
