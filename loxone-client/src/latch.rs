//! One-shot gates for the authentication sequence.
//!
//! A latch starts closed and opens exactly once; any number of senders
//! may wait on it concurrently with a bounded timeout. A fresh latch is
//! installed whenever a new authentication cycle begins; an absent latch
//! means no cycle is active.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub(crate) struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Opens the gate. Returns `false` if it was already open.
    pub(crate) fn open(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the gate opens. Returns `false` on timeout.
    pub(crate) async fn wait(&self, timeout: Duration) -> bool {
        if self.is_open() {
            return true;
        }
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|open| *open))
            .await
            .is_ok()
    }
}
