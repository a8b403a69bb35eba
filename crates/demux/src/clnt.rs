//! Client side of the demux layer

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use sigmap::{CallReader, CallWriter, SigmaError, Tag};

use crate::callmap::CallMap;
use crate::Call;

/// Multiplexes concurrent calls over one transport
///
/// Frames are written under a lock so each call lands whole on the wire;
/// a single reader task hands every reply to the caller waiting on its tag.
pub struct DemuxClnt<C: Call> {
    callmap: Arc<CallMap<C>>,
    writer: tokio::sync::Mutex<Box<dyn CallWriter<C>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Call> DemuxClnt<C> {
    /// Start the reader task; must be called inside a tokio runtime
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: CallReader<C> + 'static,
        W: CallWriter<C> + 'static,
    {
        let callmap = Arc::new(CallMap::new());
        let task = tokio::spawn(read_loop(reader, callmap.clone()));
        Self {
            callmap,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            reader: Mutex::new(Some(task)),
        }
    }

    /// Send `req` and wait for the reply carrying the same tag
    ///
    /// Fails with unreachable if the transport dies first. Dropping the
    /// returned future withdraws the tag.
    pub async fn send_receive(&self, req: C) -> Result<C, SigmaError> {
        let tag = req.tag();
        let (tx, rx) = oneshot::channel();
        self.callmap.put(tag, tx)?;
        let _pending = Pending {
            callmap: &self.callmap,
            tag,
        };

        let sent = self.writer.lock().await.write_call(&req).await;
        if let Err(e) = sent {
            tracing::debug!(%tag, "write failed: {}", e);
            if self.callmap.remove(tag).is_some() {
                return Err(unreachable(e));
            }
            // the reader got there first; its answer is already in rx
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(SigmaError::Unreachable("reply dropped".into())),
        }
    }

    /// Fail outstanding calls, stop the reader and shut the writer
    pub async fn close(&self) {
        fail_outstanding(&self.callmap);
        let reader = self.reader.lock().take();
        if let Some(task) = reader {
            task.abort();
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!("shutdown: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.callmap.is_closed()
    }

    pub fn outstanding(&self) -> usize {
        self.callmap.outstanding()
    }
}

impl<C: Call> Drop for DemuxClnt<C> {
    fn drop(&mut self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }
}

struct Pending<'a, C> {
    callmap: &'a CallMap<C>,
    tag: Tag,
}

impl<C> Drop for Pending<'_, C> {
    fn drop(&mut self) {
        self.callmap.remove(self.tag);
    }
}

fn unreachable(e: SigmaError) -> SigmaError {
    if e.is_unreachable() {
        e
    } else {
        SigmaError::Unreachable(e.to_string())
    }
}

fn fail_outstanding<C>(callmap: &CallMap<C>) {
    for tag in callmap.close() {
        if let Some(tx) = callmap.remove(tag) {
            let _ = tx.send(Err(SigmaError::Unreachable("connection closed".into())));
        }
    }
}

async fn read_loop<C, R>(mut reader: R, callmap: Arc<CallMap<C>>)
where
    C: Call,
    R: CallReader<C>,
{
    loop {
        match reader.read_call().await {
            Ok(reply) => {
                let tag = reply.tag();
                match callmap.remove(tag) {
                    Some(tx) => {
                        // the caller may have given up; nothing to do then
                        let _ = tx.send(Ok(reply));
                    }
                    None => tracing::warn!(%tag, "reply for unknown tag"),
                }
            }
            Err(e) => {
                tracing::debug!(outstanding = callmap.outstanding(), "reader exiting: {}", e);
                fail_outstanding(&callmap);
                return;
            }
        }
    }
}
