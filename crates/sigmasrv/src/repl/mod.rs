//! Replicated server substrate
//!
//! A [`Replicator`] orders opaque requests into a log and feeds every
//! committed entry, once and in log order, to the [`ApplyFn`] it was started
//! with. Because a request can be committed more than once (a client retries
//! after failover), appliers pair the log with a [`ReplyTable`] so each
//! (client, seqno) executes at most once and retries see the cached reply.
//!
//! An applier that registers a [`Snapshotter`] can have its state captured
//! and reloaded at a point between two log entries.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use sigmap::SigmaError;

pub mod local_log;
pub mod reply_table;
pub mod server;

pub use local_log::LocalLog;
pub use reply_table::{ClientReplies, Registration, ReplyFuture, ReplyKey, ReplyTable};
pub use server::{ReplOpRequest, ReplServer, RpcService};

/// Applies one committed log entry, returning the reply for its proposer
pub type ApplyFn =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, SigmaError>> + Send + Sync>;

/// The eventual reply to a proposed request
#[derive(Debug)]
pub struct Proposal {
    rx: oneshot::Receiver<Result<Vec<u8>, SigmaError>>,
}

impl Proposal {
    pub fn channel() -> (oneshot::Sender<Result<Vec<u8>, SigmaError>>, Proposal) {
        let (tx, rx) = oneshot::channel();
        (tx, Proposal { rx })
    }
}

impl Future for Proposal {
    type Output = Result<Vec<u8>, SigmaError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(r)) => Poll::Ready(r),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SigmaError::Unreachable(
                "replicator dropped proposal".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Applied state that can be captured and reloaded
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<u8>, SigmaError>;

    async fn restore(&self, snapshot: &[u8]) -> Result<(), SigmaError>;
}

#[async_trait]
pub trait Replicator: Send + Sync {
    /// Begin applying committed entries with `apply`
    async fn start(&self, apply: ApplyFn) -> Result<(), SigmaError>;

    /// Append `req` to the log
    ///
    /// Entries are ordered by the order of `propose` calls, so callers that
    /// need an order between two requests propose them from one task.
    fn propose(&self, req: Vec<u8>) -> Result<Proposal, SigmaError>;

    /// Propose `req` and wait for its applied reply
    async fn process(&self, req: Vec<u8>) -> Result<Vec<u8>, SigmaError> {
        self.propose(req)?.await
    }

    /// Register the state [`Replicator::snapshot`] captures
    fn set_snapshotter(&self, _snapshotter: Weak<dyn Snapshotter>) {}

    /// Capture the applied state after every entry committed so far
    async fn snapshot(&self) -> Result<Vec<u8>, SigmaError> {
        Err(SigmaError::Inval("replicator takes no snapshots".into()))
    }

    /// Reload applied state from a [`Replicator::snapshot`]
    async fn restore(&self, _snapshot: Vec<u8>) -> Result<(), SigmaError> {
        Err(SigmaError::Inval("replicator takes no snapshots".into()))
    }
}
