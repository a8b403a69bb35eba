//! In-process replicator: a single ordered log applied on one task

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use sigmap::SigmaError;

use super::{ApplyFn, Proposal, Replicator, Snapshotter};

type Reply<T> = oneshot::Sender<Result<T, SigmaError>>;

/// Work for the apply task, taken in log order
enum Committed {
    Entry {
        index: u64,
        req: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
    Snapshot(Reply<Vec<u8>>),
    Restore(Vec<u8>, Reply<()>),
}

/// A log with one member
///
/// Every proposal commits immediately. Entries stay in memory so they can
/// be delivered again with [`LocalLog::redeliver`], which is what a retried
/// proposal looks like to the applier after a leader change. Snapshots are
/// taken on the apply task, between two entries.
pub struct LocalLog {
    entries: Mutex<Vec<Vec<u8>>>,
    tx: flume::Sender<Committed>,
    rx: Mutex<Option<flume::Receiver<Committed>>>,
    applier: Mutex<Option<JoinHandle<()>>>,
    snapshotter: Arc<Mutex<Option<Weak<dyn Snapshotter>>>>,
}

impl Default for LocalLog {
    fn default() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            entries: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            applier: Mutex::new(None),
            snapshotter: Arc::default(),
        }
    }
}

impl LocalLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn commit(&self, index: u64, req: Vec<u8>) -> Result<Proposal, SigmaError> {
        let (reply, proposal) = Proposal::channel();
        self.send(Committed::Entry { index, req, reply })?;
        Ok(proposal)
    }

    fn send(&self, c: Committed) -> Result<(), SigmaError> {
        self.tx
            .send(c)
            .map_err(|_| SigmaError::Closed("log stopped".into()))
    }

    /// Commit the entry at `index` (1-based) a second time
    pub fn redeliver(&self, index: u64) -> Result<Proposal, SigmaError> {
        let entries = self.entries.lock();
        let req = index
            .checked_sub(1)
            .and_then(|i| entries.get(i as usize))
            .cloned()
            .ok_or_else(|| SigmaError::Inval(format!("no log entry {index}")))?;
        self.commit(index, req)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Replicator for LocalLog {
    async fn start(&self, apply: ApplyFn) -> Result<(), SigmaError> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| SigmaError::Inval("log already started".into()))?;
        let snapshotter = self.snapshotter.clone();
        let task = tokio::spawn(async move {
            while let Ok(c) = rx.recv_async().await {
                match c {
                    Committed::Entry { index, req, reply } => {
                        tracing::trace!(index, len = req.len(), "apply");
                        let _ = reply.send(apply(req).await);
                    }
                    Committed::Snapshot(reply) => {
                        let r = match current(&snapshotter) {
                            Ok(s) => s.snapshot().await,
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(r);
                    }
                    Committed::Restore(snapshot, reply) => {
                        let r = match current(&snapshotter) {
                            Ok(s) => s.restore(&snapshot).await,
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(r);
                    }
                }
            }
        });
        *self.applier.lock() = Some(task);
        Ok(())
    }

    fn propose(&self, req: Vec<u8>) -> Result<Proposal, SigmaError> {
        // hold the log lock so indices and delivery order agree
        let mut entries = self.entries.lock();
        entries.push(req.clone());
        let index = entries.len() as u64;
        self.commit(index, req)
    }

    fn set_snapshotter(&self, snapshotter: Weak<dyn Snapshotter>) {
        *self.snapshotter.lock() = Some(snapshotter);
    }

    async fn snapshot(&self) -> Result<Vec<u8>, SigmaError> {
        let (tx, rx) = oneshot::channel();
        // queued behind every entry proposed so far
        self.send(Committed::Snapshot(tx))?;
        rx.await
            .map_err(|_| SigmaError::Closed("log stopped".into()))?
    }

    async fn restore(&self, snapshot: Vec<u8>) -> Result<(), SigmaError> {
        let (tx, rx) = oneshot::channel();
        self.send(Committed::Restore(snapshot, tx))?;
        rx.await
            .map_err(|_| SigmaError::Closed("log stopped".into()))?
    }
}

fn current(
    snapshotter: &Mutex<Option<Weak<dyn Snapshotter>>>,
) -> Result<Arc<dyn Snapshotter>, SigmaError> {
    snapshotter
        .lock()
        .as_ref()
        .and_then(Weak::upgrade)
        .ok_or_else(|| SigmaError::Inval("no snapshotter registered".into()))
}

impl Drop for LocalLog {
    fn drop(&mut self) {
        if let Some(task) = self.applier.lock().take() {
            task.abort();
        }
    }
}
