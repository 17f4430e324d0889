use bscript_kernel::{Notification, Notifier};
use tokio::sync::broadcast;

/// Publishes kernel notifications to every subscribed control connection.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&mut self, notification: Notification) {
        // No subscribers is fine.
        if self.tx.send(notification).is_err() {
            tracing::trace!("notification dropped: no subscribers");
        }
    }
}
