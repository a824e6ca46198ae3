//! Per-connection outbound queue.
//!
//! Many producers (the coordinator, the connection's own reader) feed a single
//! consumer, the connection's writer. Closing is explicit: once
//! [`Mailbox::close`] is called no new messages are accepted, the receiver
//! hands out whatever was already queued and then reports the end.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::protocol::ServerMessage;

/// Sending half of a mailbox. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

/// Receiving half of a mailbox, owned by the connection's writer.
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: mpsc::Receiver<ServerMessage>,
    closed: CancellationToken,
}

/// Create a mailbox holding at most `capacity` undelivered messages.
pub fn mailbox(capacity: usize) -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();
    (
        Mailbox {
            tx,
            closed: closed.clone(),
        },
        MailboxReceiver { rx, closed },
    )
}

impl Mailbox {
    /// Enqueue without waiting. Returns false if the queue is full or closed.
    pub fn offer(&self, msg: ServerMessage) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue, waiting for space if the queue is full.
    ///
    /// Returns false if the mailbox is or becomes closed before the message
    /// could be queued.
    pub async fn send(&self, msg: ServerMessage) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            res = self.tx.send(msg) => res.is_ok(),
        }
    }

    /// Stop accepting messages. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

impl MailboxReceiver {
    /// Next queued message, in FIFO order.
    ///
    /// After the mailbox is closed this keeps returning buffered messages
    /// until the queue is empty, then `None`.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        if !self.closed.is_cancelled() {
            tokio::select! {
                biased;
                msg = self.rx.recv() => return msg,
                _ = self.closed.cancelled() => {}
            }
        }
        self.rx.close();
        self.rx.try_recv().ok()
    }

    /// Next queued message if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(n: i64) -> ServerMessage {
        ServerMessage::Echo(serde_json::json!(n))
    }

    #[tokio::test]
    async fn fifo_order() {
        let (tx, mut rx) = mailbox(8);
        for n in 0..5 {
            assert!(tx.offer(echo(n)));
        }
        for n in 0..5 {
            assert_eq!(rx.recv().await, Some(echo(n)));
        }
    }

    #[tokio::test]
    async fn offer_fails_when_full() {
        let (tx, mut rx) = mailbox(2);
        assert!(tx.offer(echo(1)));
        assert!(tx.offer(echo(2)));
        assert!(!tx.offer(echo(3)));

        // Dropped, not queued: only the first two come out.
        assert_eq!(rx.recv().await, Some(echo(1)));
        assert_eq!(rx.recv().await, Some(echo(2)));
        assert!(tx.offer(echo(4)));
        assert_eq!(rx.recv().await, Some(echo(4)));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let (tx, mut rx) = mailbox(8);
        assert!(tx.offer(echo(1)));
        assert!(tx.offer(echo(2)));
        tx.close();

        assert!(tx.is_closed());
        assert!(!tx.offer(echo(3)));
        assert!(!tx.send(echo(4)).await);

        assert_eq!(rx.recv().await, Some(echo(1)));
        assert_eq!(rx.recv().await, Some(echo(2)));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn close_wakes_waiting_receiver() {
        let (tx, mut rx) = mailbox(8);
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_releases_blocked_sender() {
        let (tx, _rx) = mailbox(1);
        assert!(tx.offer(echo(1)));

        let blocked = tx.clone();
        let pending = tokio::spawn(async move { blocked.send(echo(2)).await });
        tokio::task::yield_now().await;
        tx.close();
        assert!(!pending.await.unwrap());
    }

    #[tokio::test]
    async fn send_waits_for_space() {
        let (tx, mut rx) = mailbox(1);
        assert!(tx.offer(echo(1)));

        let sender = tx.clone();
        let pending = tokio::spawn(async move { sender.send(echo(2)).await });
        assert_eq!(rx.recv().await, Some(echo(1)));
        assert!(pending.await.unwrap());
        assert_eq!(rx.recv().await, Some(echo(2)));
    }

    #[tokio::test]
    async fn dropped_receiver_rejects_offers() {
        let (tx, rx) = mailbox(4);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.offer(echo(1)));
    }
}
