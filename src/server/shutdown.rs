//! Coordinated engine stop.
//!
//! A watch channel broadcasts the stop signal; a zero-payload mpsc channel
//! counts live tasks. Every listener and connection task holds a
//! [`Watcher`]; when the last clone drops, the engine's final
//! `complete_rx.recv()` resolves and the stop is known to be fully drained.

use tokio::sync::{mpsc, watch};

pub(crate) struct Shutdown {
    signal_tx: watch::Sender<bool>,
    complete_tx: Option<mpsc::Sender<()>>,
    complete_rx: mpsc::Receiver<()>,
}

/// Held by every task whose completion `stop` must wait for.
#[derive(Clone)]
pub(crate) struct Watcher {
    pub(crate) signal: watch::Receiver<bool>,
    _complete: mpsc::Sender<()>,
}

impl Shutdown {
    pub(crate) fn new() -> Shutdown {
        let (signal_tx, _) = watch::channel(false);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Shutdown {
            signal_tx,
            complete_tx: Some(complete_tx),
            complete_rx,
        }
    }

    pub(crate) fn watcher(&self) -> Watcher {
        Watcher {
            signal: self.signal_tx.subscribe(),
            _complete: self
                .complete_tx
                .clone()
                .expect("watcher requested after shutdown"),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal_tx.subscribe()
    }

    /// Signals every watcher and waits for all of them to drop.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.signal_tx.send(true);
        self.complete_tx.take();
        while self.complete_rx.recv().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_all_watchers() {
        let mut shutdown = Shutdown::new();
        let watcher = shutdown.watcher();
        let second = watcher.clone();

        let task = tokio::spawn(async move {
            let mut signal = watcher.signal.clone();
            signal.changed().await.unwrap();
            drop(watcher);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            drop(second);
        });

        shutdown.shutdown().await;
        task.await.unwrap();
    }
}
