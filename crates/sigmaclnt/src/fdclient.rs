//! Path and file-descriptor operations on top of a [`SessClnt`]
//!
//! Every path is resolved from the fid attached at construction. Calls that
//! change state carry the client's current fence when it covers the path
//! they touch, so a client that lost its role cannot clobber the newer
//! holder's writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use sigmap::{
    path, DirEntry, Fence, FenceId, Fid, LeaseId, Mode, Msg, Perm, SeqCounter, SigmaError, Stat,
};

use crate::sessclnt::{unexpected, SessClnt};

/// Bytes asked for per read
pub const CHUNK: u32 = 64 * 1024;

pub type Fd = u32;

#[derive(Debug, Clone)]
struct OpenFile {
    fid: Fid,
    path: String,
    offset: u64,
    mode: Mode,
}

pub struct FdClient {
    sess: Arc<SessClnt>,
    root: Fid,
    fids: SeqCounter,
    fds: Mutex<HashMap<Fd, OpenFile>>,
    next_fd: SeqCounter,
    fence: Mutex<Option<Fence>>,
}

impl FdClient {
    /// Attach `aname` as this client's root
    pub async fn attach(sess: Arc<SessClnt>, aname: &str) -> Result<Self, SigmaError> {
        let fids = SeqCounter::new(0);
        let root = Fid(fids.next() as u32);
        let msg = Msg::Tattach {
            fid: root,
            uname: format!("client-{}", sess.client()),
            aname: aname.to_string(),
        };
        match sess.rpc(msg, None).await? {
            Msg::Rattach { .. } => {}
            m => return Err(unexpected(&m)),
        }
        Ok(Self {
            sess,
            root,
            fids,
            fds: Mutex::new(HashMap::new()),
            next_fd: SeqCounter::new(0),
            fence: Mutex::new(None),
        })
    }

    pub fn sess(&self) -> &Arc<SessClnt> {
        &self.sess
    }

    /// The fence attached to mutations, if any
    pub fn fence(&self) -> Option<Fence> {
        self.fence.lock().clone()
    }

    /// The current fence if it protects any of `paths`
    fn fence_for(&self, paths: &[&str]) -> Option<Fence> {
        self.fence
            .lock()
            .as_ref()
            .filter(|f| paths.iter().any(|p| f.covers(p)))
            .cloned()
    }

    fn alloc_fid(&self) -> Fid {
        Fid(self.fids.next() as u32)
    }

    async fn walk(&self, p: &str) -> Result<Fid, SigmaError> {
        let newfid = self.alloc_fid();
        let msg = Msg::Twalk {
            fid: self.root,
            newfid,
            wnames: path::split(p),
        };
        match self.sess.rpc(msg, None).await? {
            Msg::Rwalk { .. } => Ok(newfid),
            m => Err(unexpected(&m)),
        }
    }

    async fn clunk(&self, fid: Fid, fence: Option<Fence>) -> Result<(), SigmaError> {
        match self.sess.rpc(Msg::Tclunk { fid }, fence).await? {
            Msg::Rclunk => Ok(()),
            m => Err(unexpected(&m)),
        }
    }

    /// Clunk a fid that holds no state worth reporting on
    async fn release(&self, fid: Fid) {
        if let Err(e) = self.clunk(fid, None).await {
            debug!(%fid, "clunk: {}", e);
        }
    }

    fn install(&self, fid: Fid, path: String, mode: Mode) -> Fd {
        let fd = self.next_fd.next() as Fd;
        self.fds.lock().insert(
            fd,
            OpenFile {
                fid,
                path,
                offset: 0,
                mode,
            },
        );
        fd
    }

    fn lookup(&self, fd: Fd) -> Result<OpenFile, SigmaError> {
        self.fds
            .lock()
            .get(&fd)
            .cloned()
            .ok_or_else(|| SigmaError::Inval(format!("bad fd {fd}")))
    }

    fn advance(&self, fd: Fd, n: u64) {
        if let Some(f) = self.fds.lock().get_mut(&fd) {
            f.offset += n;
        }
    }

    pub async fn open(&self, p: &str, mode: Mode) -> Result<Fd, SigmaError> {
        let p = path::normalize(p);
        let fid = self.walk(&p).await?;
        let fence = if mode.contains(Mode::OTRUNC) {
            self.fence_for(&[p.as_str()])
        } else {
            None
        };
        match self.sess.rpc(Msg::Topen { fid, mode }, fence).await {
            Ok(Msg::Ropen { .. }) => Ok(self.install(fid, p, mode)),
            Ok(m) => {
                self.release(fid).await;
                Err(unexpected(&m))
            }
            Err(e) => {
                self.release(fid).await;
                Err(e)
            }
        }
    }

    pub async fn create(&self, p: &str, perm: Perm, mode: Mode) -> Result<Fd, SigmaError> {
        self.create_with_lease(p, perm, mode, None).await
    }

    /// Create `p` and open it with `mode`
    ///
    /// With `Mode::OWATCH` an existing file is waited on until it is removed
    /// instead of failing with exists.
    pub async fn create_with_lease(
        &self,
        p: &str,
        perm: Perm,
        mode: Mode,
        lease: Option<LeaseId>,
    ) -> Result<Fd, SigmaError> {
        let p = path::normalize(p);
        let name = path::filename(&p).to_string();
        if name.is_empty() {
            return Err(SigmaError::Inval("cannot create the root".into()));
        }
        let fid = self.walk(&path::parent(&p)).await?;
        let msg = Msg::Tcreate {
            fid,
            name,
            perm,
            mode,
            lease,
        };
        match self.sess.rpc(msg, self.fence_for(&[p.as_str()])).await {
            Ok(Msg::Rcreate { .. }) => Ok(self.install(fid, p, mode)),
            Ok(m) => {
                self.release(fid).await;
                Err(unexpected(&m))
            }
            Err(e) => {
                self.release(fid).await;
                Err(e)
            }
        }
    }

    /// Read up to `count` bytes at the fd's offset
    pub async fn read(&self, fd: Fd, count: u32) -> Result<Vec<u8>, SigmaError> {
        let f = self.lookup(fd)?;
        let msg = Msg::Tread {
            fid: f.fid,
            offset: f.offset,
            count,
        };
        match self.sess.rpc(msg, None).await? {
            Msg::Rread { data } => {
                self.advance(fd, data.len() as u64);
                Ok(data)
            }
            m => Err(unexpected(&m)),
        }
    }

    pub async fn write(&self, fd: Fd, data: &[u8]) -> Result<u32, SigmaError> {
        let f = self.lookup(fd)?;
        let msg = Msg::Twrite {
            fid: f.fid,
            offset: f.offset,
            data: data.to_vec(),
        };
        match self.sess.rpc(msg, self.fence_for(&[f.path.as_str()])).await? {
            Msg::Rwrite { count } => {
                self.advance(fd, u64::from(count));
                Ok(count)
            }
            m => Err(unexpected(&m)),
        }
    }

    pub fn seek(&self, fd: Fd, offset: u64) -> Result<(), SigmaError> {
        let mut fds = self.fds.lock();
        let f = fds
            .get_mut(&fd)
            .ok_or_else(|| SigmaError::Inval(format!("bad fd {fd}")))?;
        f.offset = offset;
        Ok(())
    }

    /// Close `fd`; a file opened with `Mode::ORCLOSE` is removed
    pub async fn close(&self, fd: Fd) -> Result<(), SigmaError> {
        let f = self
            .fds
            .lock()
            .remove(&fd)
            .ok_or_else(|| SigmaError::Inval(format!("bad fd {fd}")))?;
        let fence = if f.mode.contains(Mode::ORCLOSE) {
            self.fence_for(&[f.path.as_str()])
        } else {
            None
        };
        self.clunk(f.fid, fence).await
    }

    pub async fn remove(&self, p: &str) -> Result<(), SigmaError> {
        let p = path::normalize(p);
        let msg = Msg::Tremovefile {
            fid: self.root,
            wnames: path::split(&p),
        };
        match self.sess.rpc(msg, self.fence_for(&[p.as_str()])).await? {
            Msg::Rremove => Ok(()),
            m => Err(unexpected(&m)),
        }
    }

    pub async fn stat(&self, p: &str) -> Result<Stat, SigmaError> {
        let fid = self.walk(p).await?;
        let r = self.sess.rpc(Msg::Tstat { fid }, None).await;
        self.release(fid).await;
        match r? {
            Msg::Rstat { stat } => Ok(stat),
            m => Err(unexpected(&m)),
        }
    }

    pub async fn exists(&self, p: &str) -> Result<bool, SigmaError> {
        match self.stat(p).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whole contents of `p`, without opening it
    pub async fn get_file(&self, p: &str) -> Result<Vec<u8>, SigmaError> {
        let wnames = path::split(p);
        let mut out = Vec::new();
        loop {
            let msg = Msg::Tgetfile {
                fid: self.root,
                wnames: wnames.clone(),
                mode: Mode::OREAD,
                offset: out.len() as u64,
                count: CHUNK,
            };
            match self.sess.rpc(msg, None).await? {
                Msg::Rread { data } => {
                    let done = data.len() < CHUNK as usize;
                    out.extend_from_slice(&data);
                    if done {
                        return Ok(out);
                    }
                }
                m => return Err(unexpected(&m)),
            }
        }
    }

    /// Create `p` if needed and write `data` to it in one call
    pub async fn put_file(
        &self,
        p: &str,
        perm: Perm,
        mode: Mode,
        data: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<u32, SigmaError> {
        let p = path::normalize(p);
        let msg = Msg::Tputfile {
            fid: self.root,
            wnames: path::split(&p),
            mode,
            perm,
            offset: 0,
            data: data.to_vec(),
            lease,
        };
        match self.sess.rpc(msg, self.fence_for(&[p.as_str()])).await? {
            Msg::Rwrite { count } => Ok(count),
            m => Err(unexpected(&m)),
        }
    }

    /// Rename `from` to `to`, replacing a file already at `to`
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SigmaError> {
        let (from, to) = (path::normalize(from), path::normalize(to));
        let fence = self.fence_for(&[from.as_str(), to.as_str()]);
        let (src, dst) = (path::parent(&from), path::parent(&to));
        let newname = path::filename(&to).to_string();

        if src == dst {
            let fid = self.walk(&from).await?;
            let msg = Msg::Twstat {
                fid,
                name: Some(newname),
                length: None,
            };
            let r = self.sess.rpc(msg, fence).await;
            self.release(fid).await;
            return match r? {
                Msg::Rwstat => Ok(()),
                m => Err(unexpected(&m)),
            };
        }

        let oldfid = self.walk(&src).await?;
        let newfid = match self.walk(&dst).await {
            Ok(fid) => fid,
            Err(e) => {
                self.release(oldfid).await;
                return Err(e);
            }
        };
        let msg = Msg::Trenameat {
            oldfid,
            oldname: path::filename(&from).to_string(),
            newfid,
            newname,
        };
        let r = self.sess.rpc(msg, fence).await;
        self.release(oldfid).await;
        self.release(newfid).await;
        match r? {
            Msg::Rrenameat => Ok(()),
            m => Err(unexpected(&m)),
        }
    }

    /// Entries of an opened directory, read page by page from the start
    async fn read_entries(&self, fid: Fid) -> Result<Vec<DirEntry>, SigmaError> {
        let mut entries = Vec::new();
        loop {
            let msg = Msg::Tread {
                fid,
                offset: entries.len() as u64,
                count: CHUNK,
            };
            match self.sess.rpc(msg, None).await? {
                Msg::Rread { data } => {
                    let page: Vec<DirEntry> = bincode::deserialize(&data)?;
                    if page.is_empty() {
                        return Ok(entries);
                    }
                    entries.extend(page);
                }
                m => return Err(unexpected(&m)),
            }
        }
    }

    async fn open_dir(&self, p: &str) -> Result<Fid, SigmaError> {
        let fid = self.walk(p).await?;
        let msg = Msg::Topen {
            fid,
            mode: Mode::OREAD,
        };
        match self.sess.rpc(msg, None).await {
            Ok(Msg::Ropen { qid }) if qid.is_dir() => Ok(fid),
            Ok(Msg::Ropen { .. }) => {
                self.release(fid).await;
                Err(SigmaError::NotDir(p.to_string()))
            }
            Ok(m) => {
                self.release(fid).await;
                Err(unexpected(&m))
            }
            Err(e) => {
                self.release(fid).await;
                Err(e)
            }
        }
    }

    pub async fn read_dir(&self, p: &str) -> Result<Vec<DirEntry>, SigmaError> {
        let fid = self.open_dir(p).await?;
        let r = self.read_entries(fid).await;
        self.release(fid).await;
        r
    }

    /// Read `p` until `done` accepts its entries, waiting for changes in between
    pub async fn read_dir_watch(
        &self,
        p: &str,
        done: impl Fn(&[DirEntry]) -> bool,
    ) -> Result<Vec<DirEntry>, SigmaError> {
        let fid = self.open_dir(p).await?;
        let r = async {
            loop {
                let entries = self.read_entries(fid).await?;
                if done(&entries) {
                    return Ok(entries);
                }
                match self.sess.rpc(Msg::Twatch { fid }, None).await? {
                    Msg::Rwatch => {}
                    m => return Err(unexpected(&m)),
                }
            }
        }
        .await;
        self.release(fid).await;
        r
    }

    /// Block until the directory `p` changes
    pub async fn watch_dir(&self, p: &str) -> Result<(), SigmaError> {
        let fid = self.walk(p).await?;
        let r = self.sess.rpc(Msg::Twatch { fid }, None).await;
        self.release(fid).await;
        match r? {
            Msg::Rwatch => Ok(()),
            m => Err(unexpected(&m)),
        }
    }

    /// Register `fence` with the server and attach it to later mutations
    pub async fn set_fence(&self, fence: Fence) -> Result<(), SigmaError> {
        match self.sess.rpc(Msg::Tfence { fence: fence.clone() }, None).await? {
            Msg::Rfence => {
                *self.fence.lock() = Some(fence);
                Ok(())
            }
            m => Err(unexpected(&m)),
        }
    }

    pub async fn clear_fence(&self, id: &FenceId) -> Result<(), SigmaError> {
        match self.sess.rpc(Msg::Tunfence { id: id.clone() }, None).await? {
            Msg::Runfence => {
                let mut fence = self.fence.lock();
                if fence.as_ref().is_some_and(|f| &f.id == id) {
                    *fence = None;
                }
                Ok(())
            }
            m => Err(unexpected(&m)),
        }
    }

    pub async fn lease(&self, ttl: Duration) -> Result<LeaseId, SigmaError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        match self.sess.rpc(Msg::Tlease { ttl_ms }, None).await? {
            Msg::Rlease { lease } => Ok(lease),
            m => Err(unexpected(&m)),
        }
    }

    pub async fn renew(&self, lease: LeaseId) -> Result<(), SigmaError> {
        match self.sess.rpc(Msg::Trenew { lease }, None).await? {
            Msg::Rrenew => Ok(()),
            m => Err(unexpected(&m)),
        }
    }

    /// End `lease` now; its files are removed
    pub async fn revoke(&self, lease: LeaseId) -> Result<(), SigmaError> {
        match self.sess.rpc(Msg::Trevoke { lease }, None).await? {
            Msg::Rrevoke => Ok(()),
            m => Err(unexpected(&m)),
        }
    }
}
