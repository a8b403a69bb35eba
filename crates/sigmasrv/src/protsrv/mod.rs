//! Protocol semantics of each fcall
//!
//! A [`ProtSrv`] runs one fcall for one session, on that session's thread.
//! Directory mutations are conditional on the directory version read just
//! before them and retry when another session got there first. Every
//! successful one wakes the watchers of the directories it touched.

mod mutate;

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use sigmap::{path, DirEntry, Fcall, Fence, Fid, Mode, Msg, Qid, Qpath, SigmaError};

use crate::fences::FenceGuard;
use crate::fid::FidState;
use crate::fssrv::{Core, FsSession};
use crate::threadmgr::ThreadHandle;

/// Virtual file every directory answers `Tgetfile` for with the server stats
pub const STATS_FILE: &str = ".statsd";

pub(crate) struct ProtSrv<'a> {
    core: &'a Core,
    sess: &'a FsSession,
    thread: &'a ThreadHandle,
}

impl<'a> ProtSrv<'a> {
    pub(crate) fn new(core: &'a Core, sess: &'a FsSession, thread: &'a ThreadHandle) -> Self {
        Self { core, sess, thread }
    }

    /// Run `fc`, turning any failure into an `Rerror`
    pub(crate) async fn dispatch(&self, fc: &Fcall) -> Msg {
        match self.run(fc).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!(sid = %self.sess.sid(), op = fc.msg.name(), "{}", e);
                Msg::Rerror(e)
            }
        }
    }

    async fn run(&self, fc: &Fcall) -> Result<Msg, SigmaError> {
        let fence = fc.fence.as_ref();
        match &fc.msg {
            Msg::Tattach { fid, uname, aname } => self.attach(*fid, uname, aname).await,
            Msg::Twalk { fid, newfid, wnames } => self.walk(*fid, *newfid, wnames).await,
            Msg::Topen { fid, mode } => self.open(*fid, *mode, fence).await,
            Msg::Tcreate {
                fid,
                name,
                perm,
                mode,
                lease,
            } => self.create(*fid, name, *perm, *mode, *lease, fence).await,
            Msg::Tread { fid, offset, count } => self.read(*fid, *offset, *count).await,
            Msg::Twrite { fid, offset, data } => self.write(*fid, *offset, data, fence).await,
            Msg::Tclunk { fid } => self.clunk(*fid, fence).await,
            Msg::Tremove { fid } => {
                let st = self.sess.fids.remove(*fid)?;
                self.remove_object(&st, fence).await?;
                Ok(Msg::Rremove)
            }
            Msg::Tremovefile { fid, wnames } => self.remove_file(*fid, wnames, fence).await,
            Msg::Tstat { fid } => {
                let st = self.sess.fids.lookup(*fid)?;
                let stat = self.core.store.stat(st.qid.path).await?;
                Ok(Msg::Rstat { stat })
            }
            Msg::Twstat { fid, name, length } => {
                self.wstat(*fid, name.as_deref(), *length, fence).await
            }
            Msg::Trenameat {
                oldfid,
                oldname,
                newfid,
                newname,
            } => {
                self.rename_at(*oldfid, oldname, *newfid, newname, fence)
                    .await
            }
            Msg::Tgetfile {
                fid,
                wnames,
                mode,
                offset,
                count,
            } => self.get_file(*fid, wnames, *mode, *offset, *count).await,
            Msg::Tputfile {
                fid,
                wnames,
                mode,
                perm,
                offset,
                data,
                lease,
            } => {
                self.put_file(*fid, wnames, *mode, *perm, *offset, data, *lease, fence)
                    .await
            }
            Msg::Twatch { fid } => self.watch(*fid).await,
            Msg::Tdetach => self.detach().await,
            Msg::Tlease { ttl_ms } => {
                let lease = self
                    .core
                    .store
                    .grant_lease(Duration::from_millis(*ttl_ms))
                    .await?;
                Ok(Msg::Rlease { lease })
            }
            Msg::Trenew { lease } => {
                self.core.store.renew_lease(*lease).await?;
                Ok(Msg::Rrenew)
            }
            Msg::Trevoke { lease } => {
                let removed = self.core.store.revoke_lease(*lease).await?;
                debug!(%lease, files = removed.len(), "lease revoked");
                self.core.forget_removed(removed).await;
                Ok(Msg::Rrevoke)
            }
            Msg::Tfence { fence } => {
                self.core.rft.fence(fence).await?;
                self.sess.fences.insert(fence.clone())?;
                Ok(Msg::Rfence)
            }
            Msg::Tunfence { id } => {
                self.sess.fences.del(id)?;
                Ok(Msg::Runfence)
            }
            m => Err(SigmaError::BadFcall(format!("{} not handled here", m.name()))),
        }
    }

    /// Walk `comps` from the root, returning the object and its directory
    async fn resolve(&self, comps: &[String]) -> Result<(Qid, Qpath), SigmaError> {
        let mut qid = self.core.store.root();
        let mut parent = qid.path;
        for name in comps {
            if !qid.is_dir() {
                return Err(SigmaError::NotDir(name.clone()));
            }
            let next = self.core.store.lookup(qid.path, name).await?;
            parent = qid.path;
            qid = next;
        }
        Ok((qid, parent))
    }

    /// The fid's state, provided it was opened with a mode `allowed` accepts
    fn opened(&self, fid: Fid, allowed: fn(Mode) -> bool) -> Result<(FidState, Mode), SigmaError> {
        let st = self.sess.fids.lookup(fid)?;
        match st.mode {
            Some(mode) if allowed(mode) => Ok((st, mode)),
            Some(_) => Err(SigmaError::Inval(format!("fid {fid} mode"))),
            None => Err(SigmaError::Inval(format!("fid {fid} not open"))),
        }
    }

    /// Admit a mutation of `targets`
    ///
    /// Collects the session's registered fences covering any target plus the
    /// fence carried by the fcall, which must cover one of them. Guards are
    /// taken in path order and must be held until the mutation is done.
    async fn fence_guards(
        &self,
        fence: Option<&Fence>,
        targets: &[&str],
    ) -> Result<Vec<FenceGuard>, SigmaError> {
        let mut fences: BTreeMap<String, (Fence, &str)> = BTreeMap::new();
        for t in targets {
            for f in self.sess.fences.fences(t) {
                fences.insert(f.id.path.clone(), (f, *t));
            }
        }
        if let Some(f) = fence {
            let t = targets.iter().find(|t| f.covers(t)).ok_or_else(|| {
                SigmaError::Inval(format!("fence {} does not cover {}", f, targets.join(" ")))
            })?;
            fences.insert(path::normalize(&f.id.path), (f.clone(), *t));
        }

        let mut guards = Vec::with_capacity(fences.len());
        for (f, t) in fences.values() {
            guards.push(self.core.rft.check(f, t).await?);
        }
        Ok(guards)
    }

    async fn attach(&self, fid: Fid, uname: &str, aname: &str) -> Result<Msg, SigmaError> {
        let comps = path::split(aname);
        let (qid, parent) = self.resolve(&comps).await?;
        if !qid.is_dir() {
            return Err(SigmaError::NotDir(aname.to_string()));
        }
        self.sess.fids.insert(fid, FidState::new(comps, qid, parent))?;
        debug!(sid = %self.sess.sid(), uname, aname, "attached");
        Ok(Msg::Rattach { qid })
    }

    async fn walk(&self, fid: Fid, newfid: Fid, wnames: &[String]) -> Result<Msg, SigmaError> {
        let st = self.sess.fids.lookup(fid)?;
        let mut comps = st.path.clone();
        let mut qid = st.qid;
        let mut parent = st.parent;
        let mut qids = Vec::with_capacity(wnames.len());

        for name in wnames {
            match name.as_str() {
                "." | "" => {}
                ".." => {
                    comps.pop();
                    (qid, parent) = self.resolve(&comps).await?;
                }
                _ => {
                    if !qid.is_dir() {
                        return Err(SigmaError::NotDir(path::join(&comps)));
                    }
                    let next = self.core.store.lookup(qid.path, name).await?;
                    comps.push(name.clone());
                    parent = qid.path;
                    qid = next;
                }
            }
            qids.push(qid);
        }

        let walked = FidState::new(comps, qid, parent);
        if newfid == fid {
            self.sess.fids.update(fid, |s| *s = walked)?;
        } else {
            self.sess.fids.insert(newfid, walked)?;
        }
        Ok(Msg::Rwalk { qids })
    }

    async fn open(&self, fid: Fid, mode: Mode, fence: Option<&Fence>) -> Result<Msg, SigmaError> {
        let st = self.sess.fids.lookup(fid)?;
        if st.mode.is_some() {
            return Err(SigmaError::Inval(format!("fid {fid} already open")));
        }

        let qid = if st.qid.is_dir() {
            if mode.can_write() || mode.contains(Mode::OTRUNC) {
                return Err(SigmaError::IsDir(st.path_str()));
            }
            let listing = self.core.store.read_dir(st.qid.path).await?;
            self.sess.fids.update(fid, |s| {
                s.mode = Some(mode);
                s.seen = Some(listing.version);
            })?;
            Qid {
                version: listing.version,
                ..st.qid
            }
        } else {
            if mode.contains(Mode::OTRUNC) {
                if !mode.can_write() {
                    return Err(SigmaError::Inval("truncate needs write access".into()));
                }
                let _guards = self.fence_guards(fence, &[st.path_str().as_str()]).await?;
                self.core.store.truncate(st.qid.path, 0).await?;
            }
            let stat = self.core.store.stat(st.qid.path).await?;
            self.sess.fids.update(fid, |s| s.mode = Some(mode))?;
            stat.qid
        };
        Ok(Msg::Ropen { qid })
    }

    async fn read(&self, fid: Fid, offset: u64, count: u32) -> Result<Msg, SigmaError> {
        let (st, _) = self.opened(fid, Mode::can_read)?;
        let data = if st.qid.is_dir() {
            let listing = self.core.store.read_dir(st.qid.path).await?;
            self.sess.fids.update(fid, |s| s.seen = Some(listing.version))?;
            listing_chunk(&listing.entries, offset, count)?
        } else {
            self.core.store.read(st.qid.path, offset, count).await?
        };
        Ok(Msg::Rread { data })
    }

    async fn write(
        &self,
        fid: Fid,
        offset: u64,
        data: &[u8],
        fence: Option<&Fence>,
    ) -> Result<Msg, SigmaError> {
        let (st, mode) = self.opened(fid, Mode::can_write)?;
        if st.qid.is_dir() {
            return Err(SigmaError::IsDir(st.path_str()));
        }
        let _guards = self.fence_guards(fence, &[st.path_str().as_str()]).await?;
        let offset = if mode.contains(Mode::OAPPEND) {
            self.core.store.stat(st.qid.path).await?.length
        } else {
            offset
        };
        let count = self.core.store.write(st.qid.path, offset, data).await?;
        Ok(Msg::Rwrite { count })
    }

    async fn clunk(&self, fid: Fid, fence: Option<&Fence>) -> Result<Msg, SigmaError> {
        let st = self.sess.fids.remove(fid)?;
        if st.mode.is_some_and(|m| m.contains(Mode::ORCLOSE)) {
            self.remove_object(&st, fence).await?;
        }
        Ok(Msg::Rclunk)
    }

    async fn remove_file(
        &self,
        fid: Fid,
        wnames: &[String],
        fence: Option<&Fence>,
    ) -> Result<Msg, SigmaError> {
        let st = self.sess.fids.lookup(fid)?;
        let comps = path::resolve(&st.path, wnames);
        let (qid, parent) = self.resolve(&comps).await?;
        self.remove_object(&FidState::new(comps, qid, parent), fence)
            .await?;
        Ok(Msg::Rremove)
    }

    async fn get_file(
        &self,
        fid: Fid,
        wnames: &[String],
        mode: Mode,
        offset: u64,
        count: u32,
    ) -> Result<Msg, SigmaError> {
        if !mode.can_read() {
            return Err(SigmaError::Inval("get needs read access".into()));
        }
        let st = self.sess.fids.lookup(fid)?;
        if matches!(wnames, [name] if name == STATS_FILE) {
            let stats = self.core.stats.snapshot(self.core.st.len()).to_json()?;
            return Ok(Msg::Rread {
                data: slice(&stats, offset, count),
            });
        }

        let comps = path::resolve(&st.path, wnames);
        let (qid, _) = self.resolve(&comps).await?;
        if qid.is_dir() {
            return Err(SigmaError::IsDir(path::join(&comps)));
        }
        let data = self.core.store.read(qid.path, offset, count).await?;
        Ok(Msg::Rread { data })
    }

    async fn watch(&self, fid: Fid) -> Result<Msg, SigmaError> {
        let st = self.sess.fids.lookup(fid)?;
        if !st.qid.is_dir() {
            return Err(SigmaError::NotDir(st.path_str()));
        }
        let seen = match st.seen {
            Some(v) => v,
            None => self.core.store.read_dir(st.qid.path).await?.version,
        };
        let version = self
            .core
            .wt
            .watch(
                st.qid.path,
                seen,
                self.sess.sid(),
                self.thread,
                self.core.store.as_ref(),
            )
            .await?;
        self.sess.fids.update(fid, |s| s.seen = Some(version))?;
        Ok(Msg::Rwatch)
    }

    /// Release everything the session holds
    ///
    /// Waiters of the session are failed with closed, fids opened with
    /// `ORCLOSE` are removed and so are the session's ephemeral files.
    async fn detach(&self) -> Result<Msg, SigmaError> {
        let sid = self.sess.sid();
        let woken = self.core.sct.delete_sess(sid);

        for (fid, st) in self.sess.fids.drain() {
            if st.mode.is_some_and(|m| m.contains(Mode::ORCLOSE)) {
                if let Err(e) = self.remove_object(&st, None).await {
                    debug!(%sid, %fid, "remove on close: {}", e);
                }
            }
        }
        for (qpath, file) in self.sess.take_ephemeral() {
            if let Err(e) = self.remove_ephemeral(qpath, &file).await {
                debug!(%sid, %qpath, "ephemeral cleanup: {}", e);
            }
        }

        debug!(%sid, woken, "detached");
        Ok(Msg::Rdetach)
    }
}

/// `count` bytes of `data` from `offset`
fn slice(data: &[u8], offset: u64, count: u32) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start.saturating_add(count as usize).min(data.len());
    data[start..end].to_vec()
}

/// Encode the directory entries from index `offset` that fit in `count` bytes
///
/// A directory read returns a bincode `Vec<DirEntry>`; an empty one marks the
/// end of the listing.
fn listing_chunk(entries: &[DirEntry], offset: u64, count: u32) -> Result<Vec<u8>, SigmaError> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(entries.len());
    // length prefix of the encoded sequence
    let mut size = 8u64;
    let mut end = start;
    for e in &entries[start..] {
        let n = bincode::serialized_size(e)?;
        if size + n > u64::from(count) {
            break;
        }
        size += n;
        end += 1;
    }
    if end == start && start < entries.len() {
        return Err(SigmaError::Inval(format!(
            "read count {count} too small for a directory entry"
        )));
    }
    Ok(bincode::serialize(&entries[start..end])?)
}
