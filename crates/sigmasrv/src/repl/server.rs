//! Replicated RPC server
//!
//! Wraps an [`RpcService`] so that every call goes through the log and is
//! executed once per (client, seqno), however often it is committed.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use sigmap::{ClientId, Seqno, SigmaError};

use super::{ApplyFn, Registration, ReplyKey, ReplyTable, Replicator};

#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn serve(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, SigmaError>;
}

/// One replicated call as it is written to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplOpRequest {
    pub client: ClientId,
    pub seqno: Seqno,
    /// Replies below this seqno reached the client
    pub acked: Seqno,
    pub method: String,
    pub args: Vec<u8>,
}

type Reply = Result<Vec<u8>, SigmaError>;

pub struct ReplServer<S> {
    svc: Arc<S>,
    replies: ReplyTable<Reply>,
    repl: Arc<dyn Replicator>,
}

impl<S: RpcService> ReplServer<S> {
    /// Build the server and start `repl` applying into it
    pub async fn start(svc: Arc<S>, repl: Arc<dyn Replicator>) -> Result<Arc<Self>, SigmaError> {
        let srv = Arc::new(Self {
            svc,
            replies: ReplyTable::new(),
            repl: repl.clone(),
        });
        let weak: Weak<Self> = Arc::downgrade(&srv);
        let apply: ApplyFn = Arc::new(move |req: Vec<u8>| {
            let weak = weak.clone();
            async move {
                let srv = weak
                    .upgrade()
                    .ok_or_else(|| SigmaError::Closed("server stopped".into()))?;
                srv.apply_op(&req).await
            }
            .boxed()
        });
        repl.start(apply).await?;
        Ok(srv)
    }

    /// Answer from the reply cache or send `req` through the log
    pub async fn submit_op(&self, req: ReplOpRequest) -> Reply {
        let key = ReplyKey::new(req.client, req.seqno);
        if let Some(r) = self.replies.lookup(key) {
            tracing::debug!(%key, "answered from reply cache");
            return r;
        }
        let out = self.repl.process(bincode::serialize(&req)?).await?;
        bincode::deserialize(&out)?
    }

    /// Apply one committed entry; the returned bytes encode the reply
    pub async fn apply_op(&self, entry: &[u8]) -> Result<Vec<u8>, SigmaError> {
        let req: ReplOpRequest = bincode::deserialize(entry)?;
        let reply = self.apply(req).await;
        Ok(bincode::serialize(&reply)?)
    }

    async fn apply(&self, req: ReplOpRequest) -> Reply {
        self.replies.prune(req.client, req.acked);
        let key = ReplyKey::new(req.client, req.seqno);
        match self.replies.register(key) {
            Registration::Done(r) => {
                tracing::debug!(%key, "duplicate op");
                r
            }
            Registration::InFlight(f) => f
                .wait()
                .await
                .unwrap_or_else(|| Err(SigmaError::Unreachable(format!("op {key} abandoned")))),
            Registration::Pruned => {
                tracing::debug!(%key, "duplicate of an acknowledged op");
                Err(SigmaError::Stale(format!("op {key} already acknowledged")))
            }
            Registration::New => {
                let r = self.svc.serve(&req.method, &req.args).await;
                self.replies.put_reply(key, r.clone());
                r
            }
        }
    }

    pub fn cached(&self) -> usize {
        self.replies.len()
    }
}
