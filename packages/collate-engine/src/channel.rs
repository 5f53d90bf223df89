//! Channel abstractions the engine sends into.
//!
//! The contract is deliberately narrow: `send` returns `false` on timeout or
//! rejection and never raises. The caller decides what a failed delivery
//! attempt means (the engine logs it).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use collate_core::Message;

/// Outbound channel contract shared by the output and discard channels.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Attempts delivery within the timeout. `false` means the message was
    /// not accepted; implementations must not panic or raise.
    async fn send(&self, message: Message, timeout: Duration) -> bool;
}

// ---------------------------------------------------------------------------
// NullChannel
// ---------------------------------------------------------------------------

/// Accepts and drops every message. The default discard channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullChannel;

#[async_trait]
impl MessageChannel for NullChannel {
    async fn send(&self, message: Message, _timeout: Duration) -> bool {
        tracing::trace!(message_id = %message.id(), "null channel dropped message");
        true
    }
}

// ---------------------------------------------------------------------------
// QueueChannel
// ---------------------------------------------------------------------------

/// Bounded in-process queue channel backed by a tokio mpsc queue.
pub struct QueueChannel {
    tx: mpsc::Sender<Message>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl QueueChannel {
    /// Creates a channel with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Receives the next message, waiting up to `timeout`.
    pub async fn receive(&self, timeout: Duration) -> Option<Message> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Receives without waiting.
    pub fn try_receive(&self) -> Option<Message> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl MessageChannel for QueueChannel {
    async fn send(&self, message: Message, timeout: Duration) -> bool {
        match self.tx.send_timeout(message, timeout).await {
            Ok(()) => true,
            Err(error) => {
                tracing::trace!(%error, "queue channel rejected message");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
