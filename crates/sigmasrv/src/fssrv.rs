//! The sigmaP file server
//!
//! [`FsServer::process`] is the entry point for every incoming fcall. Each
//! fcall is bound to its session and runs on the session's
//! [`ThreadMgr`](crate::threadmgr::ThreadMgr), so fcalls of one session
//! apply in the order they arrived while sessions run in parallel.
//!
//! With a [`Replicator`] configured, fcalls are proposed to the log instead.
//! The apply path hands each committed fcall to its session's thread in log
//! order, with the [`ReplyTable`] making sure a (client, seqno) executes at
//! most once; the proposer waits for the cached reply and sends it.
//!
//! [`FsServer::snapshot`] captures the server's state. Replicated, the
//! snapshot is taken by the replicator between two log entries.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sigmap::{Fcall, Msg, SessionId, Seqno, SigmaError, VERSION};

use crate::config::FsServerConfig;
use crate::fences::RecentTable;
use crate::protsrv::ProtSrv;
use crate::repl::{
    ApplyFn, Proposal, Registration, ReplyKey, ReplyTable, Replicator, Snapshotter,
};
use crate::sesscond::SessCondTable;
use crate::session::{ReplySender, Session, SessionTable};
use crate::stats::{Stats, StatsSnapshot};
use crate::store::{MemStore, Removed, Storage};
use crate::threadmgr::{OpProcessor, ThreadHandle};
use crate::watch::WatchTable;

pub type FsSession = Session<FsOps>;

/// Where the reply of a [`SessOp`] goes
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReplyTo {
    /// Straight to the session's connection
    Session,
    /// Into the reply cache, for the proposer to pick up
    Cache(ReplyKey),
}

/// One fcall queued on a session's thread
pub struct SessOp {
    sess: Arc<FsSession>,
    fc: Fcall,
    reply: ReplyTo,
}

/// Runs session ops against the server state
pub struct FsOps {
    core: Weak<Core>,
}

/// Answers one op and releases its slot on the session
///
/// Done on drop, so an op task that dies still replies and cannot keep
/// `wait_threads` from reaching zero.
struct Completion {
    core: Weak<Core>,
    sess: Arc<FsSession>,
    fc: Fcall,
    reply: ReplyTo,
    msg: Option<Msg>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let msg = self.msg.take().unwrap_or_else(|| {
            warn!(sid = %self.sess.sid(), op = self.fc.msg.name(), "op aborted");
            Msg::Rerror(SigmaError::Error(format!("{} aborted", self.fc.msg.name())))
        });
        let core = self.core.upgrade();
        if let (Some(core), Msg::Rerror(_)) = (&core, &msg) {
            core.stats.error();
        }
        match self.reply {
            ReplyTo::Session => self.sess.send_reply(self.fc.reply(msg)),
            ReplyTo::Cache(key) => {
                if let Some(core) = core {
                    core.replies.put_reply(key, msg);
                }
            }
        }
        self.sess.dec_threads();
    }
}

#[async_trait]
impl OpProcessor for FsOps {
    type Op = SessOp;

    async fn process(&self, op: SessOp, thread: ThreadHandle) {
        let SessOp { sess, fc, reply } = op;
        let mut done = Completion {
            core: self.core.clone(),
            sess,
            fc,
            reply,
            msg: None,
        };
        let msg = match self.core.upgrade() {
            Some(core) => {
                ProtSrv::new(&core, &done.sess, &thread)
                    .dispatch(&done.fc)
                    .await
            }
            None => Msg::Rerror(SigmaError::Closed("server stopped".into())),
        };
        done.msg = Some(msg);
    }
}

/// State shared by every session of one server
pub(crate) struct Core {
    pub(crate) st: SessionTable<FsOps>,
    pub(crate) sct: Arc<SessCondTable>,
    pub(crate) wt: WatchTable,
    pub(crate) rft: RecentTable,
    pub(crate) store: Arc<dyn Storage>,
    pub(crate) replies: ReplyTable<Msg>,
    pub(crate) repl: Option<Arc<dyn Replicator>>,
    pub(crate) stats: Stats,
    pub(crate) config: FsServerConfig,
}

impl Core {
    fn reply_err(&self, sess: &FsSession, fc: &Fcall, reply: ReplyTo, e: SigmaError) {
        self.stats.error();
        match reply {
            ReplyTo::Session => sess.send_reply(fc.reply(Msg::Rerror(e))),
            ReplyTo::Cache(key) => self.replies.put_reply(key, Msg::Rerror(e)),
        }
    }

    /// Queue `op` on its session's thread
    fn dispatch(self: &Arc<Self>, op: SessOp) {
        if matches!(op.fc.msg, Msg::Tdetach) {
            self.detach(op);
        } else {
            let sess = op.sess.clone();
            let fc = op.fc.clone();
            let reply = op.reply;
            if let Err(e) = sess.dispatch(op) {
                self.reply_err(&sess, &fc, reply, e);
            }
        }
    }

    /// Start closing the session of a `Tdetach` and finish in the background
    ///
    /// The detach op is queued synchronously so it runs after every fcall of
    /// the session that arrived before it.
    fn detach(self: &Arc<Self>, op: SessOp) {
        let sess = op.sess.clone();
        let fc = op.fc.clone();
        let reply = op.reply;
        match self.st.start_close(sess.sid(), op) {
            Ok(Some(sess)) => {
                let core = self.clone();
                tokio::spawn(async move { core.finish_close(&sess).await });
            }
            Ok(None) => {
                let e = SigmaError::Closed(format!("session {} closing", sess.sid()));
                self.reply_err(&sess, &fc, reply, e);
            }
            Err(e) => self.reply_err(&sess, &fc, reply, e),
        }
    }

    async fn finish_close(&self, sess: &FsSession) {
        self.st.finish_close(sess).await;
        self.sct.forget_sess(sess.sid());
        if let Some(client) = sess.client() {
            self.replies.forget_client(client);
        }
    }

    async fn close_session(self: &Arc<Self>, sid: SessionId) -> Result<(), SigmaError> {
        let sess = self
            .st
            .lookup(sid)
            .ok_or_else(|| SigmaError::NotFound(format!("session {sid}")))?;
        let fc = Fcall::new(
            sid,
            sess.client().unwrap_or_default(),
            Seqno::default(),
            Msg::Tdetach,
        );
        let op = SessOp {
            sess: sess.clone(),
            fc,
            reply: ReplyTo::Session,
        };
        match self.st.start_close(sid, op)? {
            Some(sess) => self.finish_close(&sess).await,
            None => sess.wait_threads().await,
        }
        Ok(())
    }

    /// Refresh the listed sessions, returning those still alive here
    fn heartbeat(&self, sessions: &[SessionId]) -> Vec<SessionId> {
        sessions
            .iter()
            .copied()
            .filter(|sid| match self.st.lookup(*sid) {
                Some(sess) if !sess.is_closed() => {
                    sess.touch();
                    true
                }
                _ => false,
            })
            .collect()
    }

    /// Apply one committed fcall
    ///
    /// Runs in log order on the replicator's apply task and only queues the
    /// fcall, so an op that blocks cannot stall the log.
    fn apply(self: &Arc<Self>, entry: &[u8]) -> Result<(), SigmaError> {
        let fc: Fcall = bincode::deserialize(entry)?;
        let sess = self.st.alloc(fc.session, None);
        sess.set_client(fc.client);
        let pruned = self.replies.prune(fc.client, fc.acked);
        if pruned > 0 {
            debug!(client = %fc.client, pruned, "pruned replies");
        }

        let key = ReplyKey::new(fc.client, fc.seqno);
        match self.replies.register(key) {
            Registration::New => {}
            Registration::InFlight(_) | Registration::Done(_) | Registration::Pruned => {
                debug!(%key, "duplicate fcall");
                self.stats.duplicate();
                return Ok(());
            }
        }
        self.dispatch(SessOp {
            sess,
            fc,
            reply: ReplyTo::Cache(key),
        });
        Ok(())
    }

    /// Wait until the fcall at `key` has been applied and return its reply
    async fn applied(
        &self,
        key: ReplyKey,
        proposal: Option<Result<Proposal, SigmaError>>,
        detach: bool,
    ) -> Msg {
        match proposal {
            Some(Ok(p)) => {
                if let Err(e) = p.await {
                    return Msg::Rerror(e);
                }
            }
            Some(Err(e)) => return Msg::Rerror(e),
            None => self.stats.duplicate(),
        }
        if self.replies.is_pruned(key) {
            return Msg::Rerror(SigmaError::Stale(format!("fcall {key} already acknowledged")));
        }
        match self.replies.watch(key) {
            Some(reply) => reply
                .wait()
                .await
                .unwrap_or_else(|| Msg::Rerror(SigmaError::Unreachable("reply dropped".into()))),
            // the client detached and its cached replies went with it
            None if detach => Msg::Rdetach,
            None => Msg::Rerror(SigmaError::Closed(format!("client {} detached", key.client))),
        }
    }

    async fn expire_leases(&self) -> Result<(), SigmaError> {
        let removed = self.store.expire_leases().await?;
        self.forget_removed(removed).await;
        Ok(())
    }

    /// Drop files the store deleted on its own from every session and wake
    /// the watchers of their directories
    pub(crate) async fn forget_removed(&self, removed: Vec<Removed>) {
        for r in removed {
            debug!(dir = %r.dir, name = %r.name, "lease ended");
            for sid in self.st.sessions() {
                if let Some(sess) = self.st.lookup(sid) {
                    sess.del_ephemeral(r.qpath);
                }
            }
            self.wt.wakeup(r.dir).await;
        }
    }
}

/// A sigmaP server over one [`Storage`] backend
pub struct FsServer {
    core: Arc<Core>,
    monitors: Vec<JoinHandle<()>>,
}

impl FsServer {
    pub fn builder() -> FsServerBuilder {
        FsServerBuilder::default()
    }

    /// Unreplicated server with the default configuration
    pub async fn new(store: Arc<dyn Storage>) -> Result<Self, SigmaError> {
        Self::builder().store(store).build().await
    }

    /// Handle one fcall; its reply is eventually sent on `replies`
    ///
    /// Must be called from a tokio runtime. Fcalls of one session must be
    /// handed over in the order they arrived.
    pub fn process(&self, fc: Fcall, replies: &ReplySender) {
        let core = &self.core;
        core.stats.op(&fc.msg);

        match &fc.msg {
            Msg::Tversion { msize, version } => {
                let version = if version == VERSION { VERSION } else { "unknown" };
                let msize = (*msize).min(core.config.msize);
                let _ = replies.send(fc.reply(Msg::Rversion {
                    msize,
                    version: version.to_string(),
                }));
                return;
            }
            Msg::Theartbeat { sessions } => {
                let sessions = core.heartbeat(sessions);
                let _ = replies.send(fc.reply(Msg::Rheartbeat { sessions }));
                return;
            }
            _ => {}
        }

        let sess = core.st.alloc(fc.session, Some(replies.clone()));
        sess.touch();
        sess.set_client(fc.client);

        match &core.repl {
            Some(repl) => self.propose(repl.as_ref(), sess, fc),
            None => core.dispatch(SessOp {
                sess,
                fc,
                reply: ReplyTo::Session,
            }),
        }
    }

    fn propose(&self, repl: &dyn Replicator, sess: Arc<FsSession>, fc: Fcall) {
        let core = self.core.clone();
        let key = ReplyKey::new(fc.client, fc.seqno);
        core.stats.replicated();

        // a retry of an fcall this replica already applied needs no new entry
        let proposal = match core.replies.watch(key) {
            Some(_) => None,
            None => Some(
                bincode::serialize(&fc)
                    .map_err(SigmaError::from)
                    .and_then(|entry| repl.propose(entry)),
            ),
        };

        sess.inc_threads();
        tokio::spawn(async move {
            let detach = matches!(fc.msg, Msg::Tdetach);
            let msg = core.applied(key, proposal, detach).await;
            sess.send_reply(fc.reply(msg));
            sess.dec_threads();
        });
    }

    /// Tear down `sid` as if its client had detached
    ///
    /// Used when a connection fails or a session times out. This runs on the
    /// local replica only.
    pub async fn close_session(&self, sid: SessionId) -> Result<(), SigmaError> {
        self.core.close_session(sid).await
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.core.st.sessions()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot(self.core.st.len())
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.core.store
    }

    pub fn is_replicated(&self) -> bool {
        self.core.repl.is_some()
    }

    pub fn config(&self) -> &FsServerConfig {
        &self.core.config
    }

    /// Encode the server's state
    pub async fn snapshot(&self) -> Result<Vec<u8>, SigmaError> {
        match &self.core.repl {
            Some(repl) => repl.snapshot().await,
            None => self.core.snapshot().await,
        }
    }

    /// Load a [`FsServer::snapshot`] into a server with no open sessions
    pub async fn restore(&self, snapshot: Vec<u8>) -> Result<(), SigmaError> {
        match &self.core.repl {
            Some(repl) => repl.restore(snapshot).await,
            None => self.core.restore(&snapshot).await,
        }
    }

    /// Close every session and stop the monitors
    pub async fn shutdown(&self) {
        for sid in self.sessions() {
            if let Err(e) = self.close_session(sid).await {
                debug!(%sid, "close on shutdown: {}", e);
            }
        }
        for m in &self.monitors {
            m.abort();
        }
        info!(stats = %self.stats(), "server stopped");
    }
}

impl Drop for FsServer {
    fn drop(&mut self) {
        for m in &self.monitors {
            m.abort();
        }
    }
}

#[derive(Default)]
pub struct FsServerBuilder {
    store: Option<Arc<dyn Storage>>,
    repl: Option<Arc<dyn Replicator>>,
    config: FsServerConfig,
}

impl FsServerBuilder {
    pub fn store(mut self, store: Arc<dyn Storage>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run replicated over `repl`
    pub fn replicator(mut self, repl: Arc<dyn Replicator>) -> Self {
        self.repl = Some(repl);
        self
    }

    pub fn config(mut self, config: FsServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the server; spawns its monitor tasks
    pub async fn build(self) -> Result<FsServer, SigmaError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemStore::new()) as Arc<dyn Storage>);
        let repl = self.repl;
        let config = self.config;
        let sct = Arc::new(SessCondTable::new());

        let core = Arc::new_cyclic(|weak: &Weak<Core>| Core {
            st: SessionTable::new(Arc::new(FsOps { core: weak.clone() })),
            wt: WatchTable::new(sct.clone()),
            sct,
            rft: RecentTable::new(),
            store,
            replies: ReplyTable::new(),
            repl: repl.clone(),
            stats: Stats::new(),
            config,
        });

        if let Some(repl) = repl {
            let snapshotter: Weak<dyn Snapshotter> = Arc::<Core>::downgrade(&core);
            repl.set_snapshotter(snapshotter);
            let weak = Arc::downgrade(&core);
            let apply: ApplyFn = Arc::new(move |entry: Vec<u8>| {
                let applied = match weak.upgrade() {
                    Some(core) => core.apply(&entry),
                    None => Err(SigmaError::Closed("server stopped".into())),
                };
                if let Err(e) = &applied {
                    warn!("apply: {}", e);
                }
                async move { applied.map(|()| Vec::new()) }.boxed()
            });
            repl.start(apply).await?;
        }

        let monitors = spawn_monitors(&core);
        info!(
            replicated = core.repl.is_some(),
            session_timeout = ?core.config.session_timeout,
            "server started"
        );
        Ok(FsServer { core, monitors })
    }
}

fn spawn_monitors(core: &Arc<Core>) -> Vec<JoinHandle<()>> {
    let mut monitors = Vec::new();

    if let Some(timeout) = core.config.session_timeout {
        let weak = Arc::downgrade(core);
        let period = core.config.monitor_interval;
        monitors.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(core) = weak.upgrade() else {
                    return;
                };
                for sid in core.st.expired(timeout) {
                    info!(%sid, "session timed out");
                    if let Err(e) = core.close_session(sid).await {
                        debug!(%sid, "close timed out session: {}", e);
                    }
                }
            }
        }));
    }

    let weak = Arc::downgrade(core);
    let period = core.config.lease_sweep_interval;
    monitors.push(tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(core) = weak.upgrade() else {
                return;
            };
            if let Err(e) = core.expire_leases().await {
                warn!("lease sweep: {}", e);
            }
        }
    }));

    monitors
}
