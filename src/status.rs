//! Human-readable connection status.
//!
//! Presentation only: the supervisor writes it on every transition and the
//! foreground reads whatever is current. Nothing branches on it.

use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Retrying,
    /// The controller sent `exit`.
    Disconnected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "Connecting to server...",
            Self::Connected => "Connected to server.",
            Self::Retrying => "Connection failed. Retrying...",
            Self::Disconnected => "Disconnected by server.",
        })
    }
}

/// Somewhere to publish status changes.
pub trait StatusSink: Send + Sync {
    fn publish(&self, status: Status);
}

/// Last-write-wins status cell shared with the foreground.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<Status>,
}

impl StatusBoard {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Status::Connecting);
        Self { tx }
    }

    /// Current value.
    #[must_use]
    pub fn current(&self) -> Status {
        self.tx.borrow().clone()
    }

    /// Receiver for the foreground to follow changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for StatusBoard {
    fn publish(&self, status: Status) {
        // Works with no receivers attached; repeats don't wake anyone.
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
