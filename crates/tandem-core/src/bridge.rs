//! Push/pull message bridge
//!
//! Adapts event-driven pushes (a UI handler, arriving whenever) into the
//! pull-based input a streaming call consumes:
//!
//! ```text
//! send_message ─push─▶ ┌──────────────────────┐
//! send_message ─push─▶ │ FIFO  +  one waiter  │ ◀─recv── dispatch side
//!        close ─end──▶ └──────────────────────┘
//! ```
//!
//! Only one consumer may await at a time. [`BridgeReceiver`] is not `Clone`
//! and [`BridgeReceiver::recv`] takes `&mut self`, so a second concurrent
//! consumer cannot be written.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Shared<T> {
    queue: VecDeque<T>,
    waiter: Option<oneshot::Sender<Option<T>>>,
    ended: bool,
}

/// Producer half. Cheap to clone; every clone pushes into the same buffer.
pub struct MessageBridge<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

/// Consumer half. Exactly one exists per bridge.
pub struct BridgeReceiver<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

/// Create a connected bridge and receiver
pub fn channel<T>() -> (MessageBridge<T>, BridgeReceiver<T>) {
    let shared = Arc::new(Mutex::new(Shared {
        queue: VecDeque::new(),
        waiter: None,
        ended: false,
    }));
    (
        MessageBridge {
            shared: shared.clone(),
        },
        BridgeReceiver { shared },
    )
}

impl<T> Clone for MessageBridge<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> MessageBridge<T> {
    /// Hand `message` to the waiting consumer, or buffer it.
    ///
    /// Returns `false` (and drops the message) once the bridge has ended.
    pub fn push(&self, message: T) -> bool {
        let mut shared = self.shared.lock();
        if shared.ended {
            return false;
        }
        if let Some(waiter) = shared.waiter.take() {
            match waiter.send(Some(message)) {
                Ok(()) => return true,
                // The pending recv was dropped; keep the message for the next one
                Err(Some(message)) => shared.queue.push_back(message),
                Err(None) => {}
            }
        } else {
            shared.queue.push_back(message);
        }
        true
    }

    /// End the input. Buffered messages are still delivered, then the
    /// consumer sees completion. Later pushes are no-ops.
    pub fn end(&self) {
        let mut shared = self.shared.lock();
        shared.ended = true;
        if let Some(waiter) = shared.waiter.take() {
            let _ = waiter.send(None);
        }
    }

    /// End the input and discard anything still buffered
    pub fn abort(&self) {
        let mut shared = self.shared.lock();
        shared.ended = true;
        shared.queue.clear();
        if let Some(waiter) = shared.waiter.take() {
            let _ = waiter.send(None);
        }
    }

    pub fn is_ended(&self) -> bool {
        self.shared.lock().ended
    }

    /// Number of messages pushed but not yet pulled
    pub fn buffered(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl<T> BridgeReceiver<T> {
    /// Pull the next message, waiting indefinitely for a push or an end.
    ///
    /// Returns `None` once the bridge has ended and the buffer is drained.
    /// A message handed to a recv future that is then dropped is lost, so do
    /// not race this against other branches in a `select!`.
    pub async fn recv(&mut self) -> Option<T> {
        let rx = {
            let mut shared = self.shared.lock();
            if let Some(message) = shared.queue.pop_front() {
                return Some(message);
            }
            if shared.ended {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            shared.waiter = Some(tx);
            rx
        };
        rx.await.ok().flatten()
    }

    /// Consume the receiver as a stream of messages
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut rx| async move {
            let message = rx.recv().await?;
            Some((message, rx))
        })
    }
}
