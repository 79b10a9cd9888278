//! The bounded handoff between connection workers and the application.
//!
//! A plain tokio MPSC channel: linearizable, FIFO per producer, and
//! blocking producers when full — a full queue stops connection workers
//! from reading their sockets, which surfaces as TCP backpressure to
//! clients. The single receiver sits behind an async mutex so each context
//! is handed to exactly one consumer even when `get_context` is called
//! concurrently.

use tokio::sync::{mpsc, Mutex};

use crate::context::Context;

pub(crate) fn channel(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx }, QueueReceiver { rx: Mutex::new(rx) })
}

#[derive(Clone)]
pub(crate) struct QueueSender {
    tx: mpsc::Sender<Context>,
}

impl QueueSender {
    /// Enqueues a context, suspending while the queue is full. Fails only
    /// when the engine side is gone.
    pub(crate) async fn send(&self, context: Context) -> Result<(), Context> {
        self.tx.send(context).await.map_err(|err| err.0)
    }
}

pub(crate) struct QueueReceiver {
    rx: Mutex<mpsc::Receiver<Context>>,
}

impl QueueReceiver {
    /// Dequeues the next context; `None` once all producers are gone and
    /// the queue is drained.
    pub(crate) async fn recv(&self) -> Option<Context> {
        self.rx.lock().await.recv().await
    }

    /// Closes the queue so producers can no longer enqueue.
    pub(crate) async fn close(&self) {
        self.rx.lock().await.close();
    }
}
