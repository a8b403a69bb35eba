//! Sessions and the session table
//!
//! A [`Session`] is the server's view of one client: its [`ThreadMgr`],
//! the fids it opened, the ephemeral files it created, the fences it
//! registered and the channel its replies go out on. Sessions are created
//! by the first fcall that names them and torn down by
//! [`SessionTable::close_session`], which waits for every in-flight op of
//! the session to finish before the session disappears.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use sigmap::{ClientId, Fcall, Fence, Fid, Qpath, SessionId, SigmaError};

use crate::fences::FenceTable;
use crate::fid::{FidState, FidTable};
use crate::threadmgr::{OpProcessor, ThreadHandle, ThreadMgr};

/// Where a session's replies are written
pub type ReplySender = flume::Sender<Fcall>;

/// A file the session created with the ephemeral bit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralFile {
    pub dir: Qpath,
    pub path: Vec<String>,
}

/// What a snapshot keeps of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionImage {
    pub sid: SessionId,
    pub client: Option<ClientId>,
    pub fids: Vec<(Fid, FidState)>,
    pub ephemeral: Vec<(Qpath, EphemeralFile)>,
    pub fences: Vec<Fence>,
}

struct SessState {
    replies: Option<ReplySender>,
    client: Option<ClientId>,
    closed: bool,
    last_heard: Instant,
}

pub struct Session<P: OpProcessor> {
    sid: SessionId,
    thread: ThreadMgr<P>,
    state: Mutex<SessState>,
    inflight: watch::Sender<usize>,
    ephemeral: Mutex<HashMap<Qpath, EphemeralFile>>,
    pub fids: FidTable,
    pub fences: FenceTable,
}

impl<P: OpProcessor> Session<P> {
    fn new(sid: SessionId, processor: Arc<P>, replies: Option<ReplySender>) -> Self {
        let (inflight, _) = watch::channel(0);
        Self {
            sid,
            thread: ThreadMgr::new(processor),
            state: Mutex::new(SessState {
                replies,
                client: None,
                closed: false,
                last_heard: Instant::now(),
            }),
            inflight,
            ephemeral: Mutex::new(HashMap::new()),
            fids: FidTable::new(),
            fences: FenceTable::new(),
        }
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub fn thread(&self) -> ThreadHandle {
        self.thread.handle()
    }

    /// Hand `op` to the session's thread manager
    ///
    /// The op counts as in flight until it calls [`Session::dec_threads`].
    pub fn dispatch(&self, op: P::Op) -> Result<u64, SigmaError> {
        let st = self.state.lock();
        if st.closed {
            return Err(SigmaError::Closed(format!("session {}", self.sid)));
        }
        self.inc_threads();
        self.thread.process(op).inspect_err(|_| self.dec_threads())
    }

    /// Mark the session closed and queue its detach op
    ///
    /// Returns false if the session was already closing.
    pub fn begin_close(&self, detach: P::Op) -> Result<bool, SigmaError> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(false);
        }
        st.closed = true;
        self.inc_threads();
        self.thread.process(detach).inspect_err(|_| self.dec_threads())?;
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn inc_threads(&self) {
        self.inflight.send_modify(|n| *n += 1);
    }

    pub fn dec_threads(&self) {
        self.inflight.send_modify(|n| {
            debug_assert!(*n > 0, "thread count underflow");
            *n = n.saturating_sub(1);
        });
    }

    pub fn threads(&self) -> usize {
        *self.inflight.borrow()
    }

    /// Wait until no op of this session is in flight
    pub async fn wait_threads(&self) {
        let mut rx = self.inflight.subscribe();
        // the sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn set_replies(&self, replies: ReplySender) {
        self.state.lock().replies = Some(replies);
    }

    /// Send a reply to the client, if it is still connected here
    pub fn send_reply(&self, fc: Fcall) {
        let replies = self.state.lock().replies.clone();
        match replies {
            Some(tx) => {
                if tx.send(fc).is_err() {
                    tracing::debug!(sid = %self.sid, "reply channel gone");
                }
            }
            None => tracing::trace!(sid = %self.sid, msg = fc.msg.name(), "no reply channel"),
        }
    }

    pub fn set_client(&self, client: ClientId) {
        self.state.lock().client.get_or_insert(client);
    }

    pub fn client(&self) -> Option<ClientId> {
        self.state.lock().client
    }

    /// Record that the session heard from its client
    pub fn touch(&self) {
        self.state.lock().last_heard = Instant::now();
    }

    pub fn last_heard(&self) -> Instant {
        self.state.lock().last_heard
    }

    pub fn add_ephemeral(&self, qpath: Qpath, file: EphemeralFile) {
        self.ephemeral.lock().insert(qpath, file);
    }

    pub fn del_ephemeral(&self, qpath: Qpath) -> Option<EphemeralFile> {
        self.ephemeral.lock().remove(&qpath)
    }

    /// Track an ephemeral file that moved
    pub fn move_ephemeral(&self, qpath: Qpath, file: EphemeralFile) {
        if let Some(e) = self.ephemeral.lock().get_mut(&qpath) {
            *e = file;
        }
    }

    pub fn take_ephemeral(&self) -> Vec<(Qpath, EphemeralFile)> {
        self.ephemeral.lock().drain().collect()
    }

    pub fn image(&self) -> SessionImage {
        let mut ephemeral: Vec<(Qpath, EphemeralFile)> = self
            .ephemeral
            .lock()
            .iter()
            .map(|(q, e)| (*q, e.clone()))
            .collect();
        ephemeral.sort_by_key(|(q, _)| *q);
        SessionImage {
            sid: self.sid,
            client: self.client(),
            fids: self.fids.all(),
            ephemeral,
            fences: self.fences.all(),
        }
    }
}

/// All sessions of one server
pub struct SessionTable<P: OpProcessor> {
    processor: Arc<P>,
    sessions: RwLock<HashMap<SessionId, Arc<Session<P>>>>,
}

impl<P: OpProcessor> SessionTable<P> {
    pub fn new(processor: Arc<P>) -> Self {
        Self {
            processor,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Find or create the session `sid`
    ///
    /// A `None` channel leaves an existing channel in place; sessions built
    /// by the replication apply path start without one.
    pub fn alloc(&self, sid: SessionId, replies: Option<ReplySender>) -> Arc<Session<P>> {
        if let Some(sess) = self.sessions.read().get(&sid) {
            if let Some(tx) = replies {
                sess.set_replies(tx);
            }
            return sess.clone();
        }
        let mut sessions = self.sessions.write();
        let sess = sessions.entry(sid).or_insert_with(|| {
            tracing::debug!(%sid, "new session");
            Arc::new(Session::new(sid, self.processor.clone(), None))
        });
        if let Some(tx) = replies {
            sess.set_replies(tx);
        }
        sess.clone()
    }

    pub fn lookup(&self, sid: SessionId) -> Option<Arc<Session<P>>> {
        self.sessions.read().get(&sid).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Images of the open sessions, in session order
    pub fn images(&self) -> Vec<SessionImage> {
        let mut images: Vec<SessionImage> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.is_closed())
            .map(|s| s.image())
            .collect();
        images.sort_by_key(|i| i.sid);
        images
    }

    /// Recreate sessions from their images
    ///
    /// Only an empty table can be restored. Restored sessions have no reply
    /// channel until their client talks to this server again.
    pub fn restore(&self, images: Vec<SessionImage>) -> Result<(), SigmaError> {
        let mut sessions = self.sessions.write();
        if !sessions.is_empty() {
            return Err(SigmaError::Inval(format!(
                "restore over {} open sessions",
                sessions.len()
            )));
        }
        for img in images {
            let sess = Session::new(img.sid, self.processor.clone(), None);
            if let Some(client) = img.client {
                sess.set_client(client);
            }
            sess.fids.restore(img.fids);
            sess.ephemeral.lock().extend(img.ephemeral);
            sess.fences.restore(img.fences);
            sessions.insert(img.sid, Arc::new(sess));
        }
        Ok(())
    }

    /// Open sessions not heard from within `timeout`
    pub fn expired(&self, timeout: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_closed() && now.duration_since(s.last_heard()) > timeout)
            .map(|s| s.sid())
            .collect()
    }

    /// Tear down `sid`: run `detach`, drain in-flight ops, forget the session
    pub async fn close_session(&self, sid: SessionId, detach: P::Op) -> Result<(), SigmaError> {
        match self.start_close(sid, detach)? {
            Some(sess) => self.finish_close(&sess).await,
            None => {
                tracing::debug!(%sid, "session already closing");
                if let Some(sess) = self.lookup(sid) {
                    sess.wait_threads().await;
                }
            }
        }
        Ok(())
    }

    /// First half of [`SessionTable::close_session`]: queue `detach`
    ///
    /// Runs synchronously so the detach takes its place among the session's
    /// ops in call order. Returns `None` if the session is already closing.
    pub fn start_close(
        &self,
        sid: SessionId,
        detach: P::Op,
    ) -> Result<Option<Arc<Session<P>>>, SigmaError> {
        let sess = self
            .lookup(sid)
            .ok_or_else(|| SigmaError::NotFound(format!("session {sid}")))?;
        Ok(sess.begin_close(detach)?.then_some(sess))
    }

    /// Second half: wait out in-flight ops, stop the thread, forget the session
    pub async fn finish_close(&self, sess: &Session<P>) {
        sess.wait_threads().await;
        sess.thread.stop();
        sess.thread.join().await;

        self.sessions.write().remove(&sess.sid());
        tracing::info!(sid = %sess.sid(), "session closed");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    enum Step {
        Slow(Arc<Notify>),
        Detach,
    }

    struct TestOp {
        sess: Arc<Session<Steps>>,
        step: Step,
    }

    struct Steps {
        log: Log,
    }

    #[async_trait]
    impl OpProcessor for Steps {
        type Op = TestOp;

        async fn process(&self, op: TestOp, _thread: ThreadHandle) {
            match op.step {
                Step::Slow(release) => {
                    self.log.lock().push("slow-start");
                    release.notified().await;
                    self.log.lock().push("slow-end");
                }
                Step::Detach => self.log.lock().push("detach"),
            }
            op.sess.dec_threads();
        }
    }

    fn table() -> (Arc<SessionTable<Steps>>, Log) {
        let log: Log = Arc::default();
        let st = Arc::new(SessionTable::new(Arc::new(Steps { log: log.clone() })));
        (st, log)
    }

    #[tokio::test]
    async fn test_alloc_is_idempotent_and_attaches_replies() {
        let (st, _) = table();
        let a = st.alloc(SessionId(1), None);
        let (tx, rx) = flume::unbounded();
        let b = st.alloc(SessionId(1), Some(tx));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(st.len(), 1);

        let fc = Fcall::new(SessionId(1), ClientId(1), Default::default(), sigmap::Msg::Rclunk);
        a.send_reply(fc.clone());
        assert_eq!(rx.try_recv().unwrap(), fc);
    }

    #[tokio::test]
    async fn test_close_session_drains_inflight_first() {
        let (st, log) = table();
        let sess = st.alloc(SessionId(2), None);
        let release = Arc::new(Notify::new());
        sess.dispatch(TestOp {
            sess: sess.clone(),
            step: Step::Slow(release.clone()),
        })
        .unwrap();

        let closing = {
            let st = st.clone();
            let sess = sess.clone();
            tokio::spawn(async move {
                st.close_session(
                    SessionId(2),
                    TestOp {
                        sess,
                        step: Step::Detach,
                    },
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closing.is_finished());
        assert!(st.lookup(SessionId(2)).is_some());

        release.notify_one();
        closing.await.unwrap().unwrap();
        assert_eq!(*log.lock(), vec!["slow-start", "slow-end", "detach"]);
        assert!(st.lookup(SessionId(2)).is_none());
        assert_eq!(sess.threads(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_ops() {
        let (st, _) = table();
        let sess = st.alloc(SessionId(3), None);
        st.close_session(
            SessionId(3),
            TestOp {
                sess: sess.clone(),
                step: Step::Detach,
            },
        )
        .await
        .unwrap();

        let err = sess
            .dispatch(TestOp {
                sess: sess.clone(),
                step: Step::Detach,
            })
            .unwrap_err();
        assert!(err.is_closed());
        assert_eq!(sess.threads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sessions() {
        let (st, _) = table();
        let quiet = st.alloc(SessionId(4), None);
        let chatty = st.alloc(SessionId(5), None);
        tokio::time::advance(Duration::from_secs(6)).await;
        chatty.touch();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(st.expired(Duration::from_secs(10)), vec![quiet.sid()]);
    }
}
