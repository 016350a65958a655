//! Single-fire completion channel for a unit of work.
//!
//! A [`Responder`] travels with the unit; resolving it consumes it, so a unit
//! can complete at most once. The [`Completion`] half stays with whoever
//! submitted the unit (a channel adapter, or the scheduling engine waiting on a
//! run). If the waiter has already given up, a late reply is a no-op.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// The result a unit of work reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum Reply {
    Text(String),
    Error(String),
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Reply::Text(t) | Reply::Error(t) => t,
        }
    }
}

/// Create a linked responder/completion pair.
pub fn completion() -> (Responder, Completion) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, Completion { rx })
}

/// Resolving half. Consumed on use.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Reply>,
}

impl Responder {
    /// Deliver the reply. Returns false if nobody is waiting anymore.
    pub fn respond(self, reply: Reply) -> bool {
        self.tx.send(reply).is_ok()
    }

    /// True once the waiting side has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// How waiting on a [`Completion`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Replied(Reply),
    TimedOut,
}

/// Waiting half.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Reply>,
}

impl Completion {
    /// Wait for the reply. `None` if the responder was dropped unresolved.
    pub async fn wait(self) -> Option<Reply> {
        self.rx.await.ok()
    }

    /// Wait at most `timeout`.
    ///
    /// A responder dropped without replying never counts as completion: the
    /// wait runs on until the deadline and reports `TimedOut`.
    pub async fn wait_timeout(self, timeout: Duration) -> CompletionOutcome {
        let wait = async {
            match self.rx.await {
                Ok(reply) => reply,
                Err(_) => std::future::pending().await,
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(reply) => CompletionOutcome::Replied(reply),
            Err(_) => CompletionOutcome::TimedOut,
        }
    }
}
