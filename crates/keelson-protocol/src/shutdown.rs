//! Cooperative shutdown signal shared by the protocol tasks.

use std::time::Duration;

use tokio::sync::watch;

/// Receiving side of a `watch::channel(false)` used as a stop flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal pair; sending `true` stops every clone of the receiver.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    /// Whether shutdown was requested or the sender is gone.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Sleep for `duration` unless shutdown fires first.
    ///
    /// Returns `false` when the sleep was interrupted.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = self.rx.changed() => false,
        }
    }
}
