//! Write-notification primitive shared by every adapter.
//!
//! An adapter owns a [`ChangeSender`] and calls [`ChangeSender::notify`]
//! after each committed write. Consumers (the live changes stream, a
//! continuous replicator) hold a [`ChangeReceiver`] obtained via
//! [`ChangeSender::subscribe`]. The channel is a broadcast channel rather
//! than an mpsc: any number of independent listeners can watch the same
//! database, and a slow listener only loses coalesced notifications, never
//! blocks the writer.
use tokio::sync::broadcast;

use crate::document::Seq;

/// A notification that a document was written at `seq`.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub seq: Seq,
    pub doc_id: String,
}

/// Broadcasts [`ChangeNotification`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ChangeSender {
    tx: broadcast::Sender<ChangeNotification>,
}

impl ChangeSender {
    /// `capacity` bounds how many notifications a lagging subscriber can
    /// fall behind by before it starts skipping. Subscribers never need to
    /// see every notification individually — on lag they just re-poll from
    /// their own last-seen `seq` — so a moderate capacity is enough.
    pub fn new(capacity: usize) -> (Self, ChangeReceiver) {
        let (tx, rx) = broadcast::channel(capacity);
        (ChangeSender { tx }, ChangeReceiver { rx })
    }

    /// Notify subscribers that `doc_id` was written at `seq`. Ignores the
    /// "no receivers" error: nobody watching is a normal state.
    pub fn notify(&self, seq: Seq, doc_id: String) {
        let _ = self.tx.send(ChangeNotification { seq, doc_id });
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// A subscription to a [`ChangeSender`]'s notifications.
pub struct ChangeReceiver {
    rx: broadcast::Receiver<ChangeNotification>,
}

impl ChangeReceiver {
    /// Wait for the next notification, silently skipping over lag. Returns
    /// `None` once the sender (and every clone of it) has been dropped.
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_reaches_subscriber() {
        let (tx, mut rx) = ChangeSender::new(16);
        tx.notify(Seq(1), "doc1".into());

        let note = rx.recv().await.unwrap();
        assert_eq!(note.seq, Seq(1));
        assert_eq!(note.doc_id, "doc1");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_notified() {
        let (tx, mut rx1) = ChangeSender::new(16);
        let mut rx2 = tx.subscribe();

        tx.notify(Seq(1), "doc1".into());

        assert_eq!(rx1.recv().await.unwrap().doc_id, "doc1");
        assert_eq!(rx2.recv().await.unwrap().doc_id, "doc1");
    }

    #[tokio::test]
    async fn recv_returns_none_after_sender_dropped() {
        let (tx, mut rx) = ChangeSender::new(16);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
