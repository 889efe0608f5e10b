//! Process-wide cancellation token.
//!
//! Every loop checks [`Shutdown::is_triggered`] at the top of each iteration
//! and races its blocking waits against [`Shutdown::cancelled`].

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable shutdown flag. Once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Ask every unit holding a clone of this token to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
