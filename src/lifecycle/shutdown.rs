//! Stop signal for the client's background tasks.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Broadcast the breaker timing, cache sweep and health tasks subscribe to.
///
/// The signal is sticky: [`Shutdown::is_triggered`] stays true so a task
/// spawned after the broadcast can still refuse to start.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signal every subscriber. Returns false when already triggered.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers_once() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.subscribe();
        assert_eq!(shutdown.receiver_count(), 2);
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }
}
