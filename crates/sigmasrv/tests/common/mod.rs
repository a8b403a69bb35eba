//! Fixtures shared by the server integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use sigmap::{
    ClientId, DirEntry, Fcall, Fid, LeaseId, Msg, Perm, Qid, Qpath, SeqCounter, Seqno,
    SessionId, SigmaError, Stat, Tag,
};
use sigmasrv::store::{DirListing, Removed};
use sigmasrv::{FsServer, MemStore, Storage};

pub type Events = Arc<Mutex<Vec<String>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A [`MemStore`] with slow writes that records writes and removes
pub struct SlowStore {
    inner: MemStore,
    delay: Duration,
    pub events: Events,
    /// Writes panic while set
    pub crash_writes: AtomicBool,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemStore::new(),
            delay,
            events: Events::default(),
            crash_writes: AtomicBool::new(false),
        }
    }

    fn event(&self, e: String) {
        self.events.lock().push(e);
    }
}

#[async_trait]
impl Storage for SlowStore {
    fn root(&self) -> Qid {
        self.inner.root()
    }

    async fn stat(&self, qpath: Qpath) -> Result<Stat, SigmaError> {
        self.inner.stat(qpath).await
    }

    async fn lookup(&self, dir: Qpath, name: &str) -> Result<Qid, SigmaError> {
        self.inner.lookup(dir, name).await
    }

    async fn read_dir(&self, dir: Qpath) -> Result<DirListing, SigmaError> {
        self.inner.read_dir(dir).await
    }

    async fn create(
        &self,
        dir: Qpath,
        version: u32,
        name: &str,
        perm: Perm,
        lease: Option<LeaseId>,
    ) -> Result<Qid, SigmaError> {
        self.inner.create(dir, version, name, perm, lease).await
    }

    async fn remove(&self, dir: Qpath, version: u32, name: &str) -> Result<Qpath, SigmaError> {
        let r = self.inner.remove(dir, version, name).await;
        if r.is_ok() {
            self.event(format!("remove {name}"));
        }
        r
    }

    async fn rename(
        &self,
        dir: Qpath,
        version: u32,
        from: &str,
        to: &str,
    ) -> Result<(), SigmaError> {
        self.inner.rename(dir, version, from, to).await
    }

    async fn rename_at(
        &self,
        src: (Qpath, u32),
        from: &str,
        dst: (Qpath, u32),
        to: &str,
    ) -> Result<(), SigmaError> {
        self.inner.rename_at(src, from, dst, to).await
    }

    async fn read(&self, file: Qpath, offset: u64, count: u32) -> Result<Vec<u8>, SigmaError> {
        self.inner.read(file, offset, count).await
    }

    async fn write(&self, file: Qpath, offset: u64, data: &[u8]) -> Result<u32, SigmaError> {
        self.event("write-start".into());
        tokio::time::sleep(self.delay).await;
        if self.crash_writes.load(Ordering::Relaxed) {
            panic!("store crashed mid-write");
        }
        let n = self.inner.write(file, offset, data).await;
        self.event("write-end".into());
        n
    }

    async fn truncate(&self, file: Qpath, length: u64) -> Result<(), SigmaError> {
        self.inner.truncate(file, length).await
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, SigmaError> {
        self.inner.grant_lease(ttl).await
    }

    async fn renew_lease(&self, lease: LeaseId) -> Result<(), SigmaError> {
        self.inner.renew_lease(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<Vec<Removed>, SigmaError> {
        self.inner.revoke_lease(lease).await
    }

    async fn expire_leases(&self) -> Result<Vec<Removed>, SigmaError> {
        self.inner.expire_leases().await
    }

    async fn snapshot(&self) -> Result<Vec<u8>, SigmaError> {
        self.inner.snapshot().await
    }

    async fn restore(&self, snapshot: &[u8]) -> Result<(), SigmaError> {
        self.inner.restore(snapshot).await
    }
}

/// One client session talking to a server in-process
pub struct Conn {
    fs: Arc<FsServer>,
    pub sid: SessionId,
    pub client: ClientId,
    tags: SeqCounter,
    seqnos: SeqCounter,
    tx: flume::Sender<Fcall>,
    rx: flume::Receiver<Fcall>,
    stash: Vec<Fcall>,
}

impl Conn {
    pub fn new(fs: &Arc<FsServer>, sid: u64) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            fs: fs.clone(),
            sid: SessionId(sid),
            client: ClientId(sid),
            tags: SeqCounter::new(0),
            seqnos: SeqCounter::new(0),
            tx,
            rx,
            stash: Vec::new(),
        }
    }

    pub fn fcall(&self, msg: Msg) -> Fcall {
        Fcall::new(self.sid, self.client, Seqno(self.seqnos.next()), msg)
            .with_tag(Tag(self.tags.next()))
    }

    pub fn send(&self, fc: Fcall) -> Tag {
        let tag = fc.tag;
        self.fs.process(fc, &self.tx);
        tag
    }

    /// Wait for the reply to `tag`, keeping other replies for later
    pub async fn reply(&mut self, tag: Tag) -> Msg {
        if let Some(i) = self.stash.iter().position(|fc| fc.tag == tag) {
            return self.stash.remove(i).msg;
        }
        loop {
            let fc = tokio::time::timeout(Duration::from_secs(5), self.rx.recv_async())
                .await
                .expect("reply timed out")
                .expect("reply channel closed");
            if fc.tag == tag {
                return fc.msg;
            }
            self.stash.push(fc);
        }
    }

    pub async fn call(&mut self, msg: Msg) -> Msg {
        let fc = self.fcall(msg);
        let tag = self.send(fc);
        self.reply(tag).await
    }

    /// Attach the root to fid 0
    pub async fn attach(&mut self) {
        let r = self
            .call(Msg::Tattach {
                fid: Fid(0),
                uname: "test".into(),
                aname: String::new(),
            })
            .await;
        assert!(matches!(r, Msg::Rattach { .. }), "{r:?}");
    }

    pub async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> Msg {
        self.call(Msg::Twalk {
            fid: Fid(fid),
            newfid: Fid(newfid),
            wnames: names.iter().map(|n| n.to_string()).collect(),
        })
        .await
    }

    /// Names in the root directory
    pub async fn ls_root(&self) -> Vec<String> {
        let store = self.fs.store();
        let listing = store.read_dir(store.root().path).await.unwrap();
        listing.entries.into_iter().map(|e| e.name).collect()
    }
}

/// Decode a directory read
pub fn entries(data: &[u8]) -> Vec<DirEntry> {
    bincode::deserialize(data).unwrap()
}

pub async fn until(mut cond: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}
