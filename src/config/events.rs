//! Reload signal fan-out.
//!
//! A broadcast relay delivering an empty signal. Each long-lived task holds a
//! receiver and otherwise sleeps; publishing wakes every listener at least
//! once instead of forcing them to poll a shared flag.

use tokio::sync::broadcast;

/// Default channel capacity for reload signals.
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Broadcaster for configuration reload signals.
pub struct ReloadBroadcaster {
    sender: broadcast::Sender<()>,
}

impl ReloadBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to reload signals.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Publish a reload signal without blocking.
    ///
    /// Returns the number of receivers that were woken; zero when no task is
    /// listening, which is fine.
    pub fn publish(&self) -> usize {
        tracing::debug!("publishing config reload signal");
        self.sender.send(()).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ReloadBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ReloadBroadcaster {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
