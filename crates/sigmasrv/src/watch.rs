//! Directory watches
//!
//! Each watched directory gets one [`Watch`] with a lock and a
//! [`SessCond`]. A watcher re-reads the directory version under the lock
//! before it waits, and mutators broadcast under the same lock after they
//! change the directory, so a change cannot slip between the check and the
//! wait. Watches are reference counted and go away with their last user.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sigmap::{Qpath, SessionId, SigmaError};

use crate::sesscond::{SessCond, SessCondTable};
use crate::store::Storage;
use crate::threadmgr::ThreadHandle;

struct Watch {
    lock: Arc<tokio::sync::Mutex<()>>,
    cond: Arc<SessCond>,
    refs: usize,
}

pub struct WatchTable {
    sct: Arc<SessCondTable>,
    watches: Mutex<HashMap<Qpath, Watch>>,
}

/// Keeps a watch alive while a watcher uses it
struct WatchRef<'a> {
    table: &'a WatchTable,
    dir: Qpath,
    lock: Arc<tokio::sync::Mutex<()>>,
    cond: Arc<SessCond>,
}

impl Drop for WatchRef<'_> {
    fn drop(&mut self) {
        self.table.release(self.dir);
    }
}

impl WatchTable {
    pub fn new(sct: Arc<SessCondTable>) -> Self {
        Self {
            sct,
            watches: Mutex::new(HashMap::new()),
        }
    }

    fn acquire(&self, dir: Qpath) -> WatchRef<'_> {
        let mut watches = self.watches.lock();
        let w = watches.entry(dir).or_insert_with(|| Watch {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            cond: self.sct.new_sess_cond(),
            refs: 0,
        });
        w.refs += 1;
        WatchRef {
            table: self,
            dir,
            lock: w.lock.clone(),
            cond: w.cond.clone(),
        }
    }

    fn release(&self, dir: Qpath) {
        let mut watches = self.watches.lock();
        let Some(w) = watches.get_mut(&dir) else {
            return;
        };
        w.refs -= 1;
        if w.refs == 0 {
            if let Some(w) = watches.remove(&dir) {
                self.sct.free_sess_cond(&w.cond);
            }
        }
    }

    /// Block until `dir`'s version differs from `seen`, returning the new one
    ///
    /// Sleeps through the session's thread manager; fails with closed if
    /// the session is torn down meanwhile.
    pub async fn watch(
        &self,
        dir: Qpath,
        seen: u32,
        sid: SessionId,
        thread: &ThreadHandle,
        store: &dyn Storage,
    ) -> Result<u32, SigmaError> {
        let w = self.acquire(dir);
        let mut guard = w.lock.clone().lock_owned().await;
        loop {
            let version = store.read_dir(dir).await?.version;
            if version != seen {
                return Ok(version);
            }
            tracing::debug!(%sid, %dir, version, "watch waits");
            guard = w.cond.wait(sid, thread, guard).await?;
        }
    }

    /// Wake everyone watching `dir`
    pub async fn wakeup(&self, dir: Qpath) {
        let Some((lock, cond)) = self
            .watches
            .lock()
            .get(&dir)
            .map(|w| (w.lock.clone(), w.cond.clone()))
        else {
            return;
        };
        let _guard = lock.lock().await;
        let n = cond.broadcast();
        tracing::debug!(%dir, woken = n, "watch wakeup");
    }

    /// Directories with at least one watcher
    pub fn len(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::store::MemStore;
    use crate::threadmgr::{OpProcessor, ThreadMgr};

    struct Watcher {
        wt: Arc<WatchTable>,
        store: Arc<MemStore>,
    }

    #[async_trait]
    impl OpProcessor for Watcher {
        type Op = (SessionId, u32, oneshot::Sender<Result<u32, SigmaError>>);

        async fn process(&self, op: Self::Op, thread: ThreadHandle) {
            let (sid, seen, done) = op;
            let root = self.store.root().path;
            let r = self
                .wt
                .watch(root, seen, sid, &thread, self.store.as_ref())
                .await;
            let _ = done.send(r);
        }
    }

    struct Fixture {
        sct: Arc<SessCondTable>,
        wt: Arc<WatchTable>,
        store: Arc<MemStore>,
        tm: ThreadMgr<Watcher>,
    }

    fn fixture() -> Fixture {
        let sct = Arc::new(SessCondTable::new());
        let wt = Arc::new(WatchTable::new(sct.clone()));
        let store = Arc::new(MemStore::new());
        let tm = ThreadMgr::new(Arc::new(Watcher {
            wt: wt.clone(),
            store: store.clone(),
        }));
        Fixture { sct, wt, store, tm }
    }

    async fn until_watched(wt: &WatchTable) {
        for _ in 0..2000 {
            if !wt.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("watch never registered");
    }

    #[tokio::test]
    async fn test_change_wakes_watcher() {
        let fx = fixture();
        let root = fx.store.root().path;
        let v = fx.store.read_dir(root).await.unwrap().version;

        let (tx, rx) = oneshot::channel();
        fx.tm.process((SessionId(1), v, tx)).unwrap();
        until_watched(&fx.wt).await;

        fx.store
            .create(root, v, "x", sigmap::Perm(0o644), None)
            .await
            .unwrap();
        fx.wt.wakeup(root).await;

        let seen = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, Ok(v + 1));

        // the watch is reclaimed with its last watcher
        for _ in 0..2000 {
            if fx.wt.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(fx.wt.is_empty());
        assert!(fx.sct.is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_returns_at_once() {
        let fx = fixture();
        let (tx, rx) = oneshot::channel();
        fx.tm.process((SessionId(1), 99, tx)).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(0));
    }

    #[tokio::test]
    async fn test_session_close_ends_watch() {
        let fx = fixture();
        let (tx, rx) = oneshot::channel();
        fx.tm.process((SessionId(4), 0, tx)).unwrap();
        until_watched(&fx.wt).await;
        // registration happens under the watch lock once the watch exists
        let lock = fx.wt.watches.lock().get(&fx.store.root().path).map(|w| w.lock.clone());
        drop(lock.unwrap().lock().await);

        fx.sct.delete_sess(SessionId(4));
        let r = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(r.unwrap_err().is_closed());
    }
}
