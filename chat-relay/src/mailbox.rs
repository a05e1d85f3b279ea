//! Per-session outbound queue.
//!
//! A [`Mailbox`] is the producing half owned by the broker's registry and an
//! [`Inbox`] is the consuming half drained by the session's writer. The queue
//! is bounded and [`Mailbox::offer`] never waits: a full queue is reported back
//! to the caller so one stalled reader cannot hold up fan-out to everybody else.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Creates a connected mailbox/inbox pair holding at most `capacity` lines.
pub fn mailbox(capacity: usize) -> (Mailbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    let mailbox = Mailbox {
        tx,
        _closed: closed.clone().drop_guard(),
    };
    (mailbox, Inbox { rx, closed })
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    #[error("mailbox is full")]
    Full,
    #[error("mailbox consumer is gone")]
    Closed,
}

/// Sending half. Not `Clone`: the registry is the only producer, and
/// [`Mailbox::close`] consumes it so a mailbox can be closed at most once.
#[derive(Debug)]
pub struct Mailbox {
    tx: mpsc::Sender<String>,
    _closed: DropGuard,
}

impl Mailbox {
    pub fn offer(&self, line: String) -> Result<(), OfferError> {
        self.tx.try_send(line).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => OfferError::Full,
            mpsc::error::TrySendError::Closed(_) => OfferError::Closed,
        })
    }

    /// Closes the mailbox. Lines already queued stay readable from the inbox.
    pub fn close(self) {
        drop(self);
    }
}

#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<String>,
    closed: CancellationToken,
}

impl Inbox {
    /// Fires as soon as the mailbox is closed or dropped, even while lines
    /// are still queued.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Next queued line, or `None` once the mailbox is closed and drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}
