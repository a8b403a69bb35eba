//! Directory mutations: create, remove, rename, put

use tracing::debug;

use sigmap::{path, Fence, Fid, LeaseId, Mode, Msg, Perm, Qpath, SigmaError};

use super::ProtSrv;
use crate::fid::FidState;
use crate::session::EphemeralFile;

fn check_name(name: &str) -> Result<(), SigmaError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SigmaError::Inval(format!("bad name {name:?}")));
    }
    Ok(())
}

fn child(dir: &[String], name: &str) -> Vec<String> {
    let mut comps = dir.to_vec();
    comps.push(name.to_string());
    comps
}

impl ProtSrv<'_> {
    pub(super) async fn create(
        &self,
        fid: Fid,
        name: &str,
        perm: Perm,
        mode: Mode,
        lease: Option<LeaseId>,
        fence: Option<&Fence>,
    ) -> Result<Msg, SigmaError> {
        check_name(name)?;
        let st = self.sess.fids.lookup(fid)?;
        if !st.qid.is_dir() {
            return Err(SigmaError::NotDir(st.path_str()));
        }
        let dir = st.qid.path;
        let comps = child(&st.path, name);
        let target = path::join(&comps);

        let qid = loop {
            let listing = self.core.store.read_dir(dir).await?;
            if listing.get(name).is_some() {
                if !mode.contains(Mode::OWATCH) {
                    return Err(SigmaError::Exists(target));
                }
                self.core
                    .wt
                    .watch(
                        dir,
                        listing.version,
                        self.sess.sid(),
                        self.thread,
                        self.core.store.as_ref(),
                    )
                    .await?;
                continue;
            }
            let _guards = self.fence_guards(fence, &[target.as_str()]).await?;
            match self
                .core
                .store
                .create(dir, listing.version, name, perm, lease)
                .await
            {
                Ok(qid) => break qid,
                Err(e) if e.is_version() => continue,
                Err(e) => return Err(e),
            }
        };

        if perm.is_ephemeral() {
            self.sess.add_ephemeral(
                qid.path,
                EphemeralFile {
                    dir,
                    path: comps.clone(),
                },
            );
        }
        self.core.wt.wakeup(dir).await;

        let mut created = FidState::new(comps, qid, dir);
        created.mode = Some(mode);
        if qid.is_dir() {
            created.seen = Some(qid.version);
        }
        self.sess.fids.update(fid, |s| *s = created)?;
        debug!(sid = %self.sess.sid(), path = %target, "created");
        Ok(Msg::Rcreate { qid })
    }

    /// Unlink the object `st` is bound to, provided it is still there
    pub(super) async fn remove_object(
        &self,
        st: &FidState,
        fence: Option<&Fence>,
    ) -> Result<(), SigmaError> {
        let Some(name) = st.name() else {
            return Err(SigmaError::Inval("cannot remove the root".into()));
        };
        let _guards = self.fence_guards(fence, &[st.path_str().as_str()]).await?;
        loop {
            let listing = self.core.store.read_dir(st.parent).await?;
            match listing.get(name) {
                Some(e) if e.qid.path == st.qid.path => {}
                _ => return Err(SigmaError::NotFound(st.path_str())),
            }
            match self
                .core
                .store
                .remove(st.parent, listing.version, name)
                .await
            {
                Ok(qpath) => {
                    self.sess.del_ephemeral(qpath);
                    self.core.wt.wakeup(st.parent).await;
                    return Ok(());
                }
                Err(e) if e.is_version() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove an ephemeral file of a departing session
    ///
    /// A file that was removed or replaced meanwhile is left alone.
    pub(super) async fn remove_ephemeral(
        &self,
        qpath: Qpath,
        file: &EphemeralFile,
    ) -> Result<(), SigmaError> {
        let Some(name) = file.path.last() else {
            return Ok(());
        };
        loop {
            let listing = self.core.store.read_dir(file.dir).await?;
            match listing.get(name) {
                Some(e) if e.qid.path == qpath => {}
                _ => return Ok(()),
            }
            match self.core.store.remove(file.dir, listing.version, name).await {
                Ok(_) => {
                    debug!(sid = %self.sess.sid(), path = %path::join(&file.path), "removed ephemeral");
                    self.core.wt.wakeup(file.dir).await;
                    return Ok(());
                }
                Err(e) if e.is_version() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(super) async fn wstat(
        &self,
        fid: Fid,
        name: Option<&str>,
        length: Option<u64>,
        fence: Option<&Fence>,
    ) -> Result<Msg, SigmaError> {
        let st = self.sess.fids.lookup(fid)?;
        let mut targets = vec![st.path_str()];
        let renamed = match name {
            Some(new) if st.name() != Some(new) => {
                check_name(new)?;
                let Some((_, dir)) = st.path.split_last() else {
                    return Err(SigmaError::Inval("cannot rename the root".into()));
                };
                let comps = child(dir, new);
                targets.push(path::join(&comps));
                Some((new, comps))
            }
            _ => None,
        };
        let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
        let _guards = self.fence_guards(fence, &targets).await?;

        if let Some(length) = length {
            if st.qid.is_dir() {
                return Err(SigmaError::IsDir(st.path_str()));
            }
            self.core.store.truncate(st.qid.path, length).await?;
        }

        if let Some((new, comps)) = renamed {
            let Some(old) = st.name() else {
                return Err(SigmaError::Inval("cannot rename the root".into()));
            };
            loop {
                let listing = self.core.store.read_dir(st.parent).await?;
                match listing.get(old) {
                    Some(e) if e.qid.path == st.qid.path => {}
                    _ => return Err(SigmaError::NotFound(st.path_str())),
                }
                match self
                    .core
                    .store
                    .rename(st.parent, listing.version, old, new)
                    .await
                {
                    Ok(()) => break,
                    Err(e) if e.is_version() => continue,
                    Err(e) => return Err(e),
                }
            }
            self.sess.move_ephemeral(
                st.qid.path,
                EphemeralFile {
                    dir: st.parent,
                    path: comps.clone(),
                },
            );
            self.sess.fids.update(fid, |s| s.path = comps)?;
            self.core.wt.wakeup(st.parent).await;
        }
        Ok(Msg::Rwstat)
    }

    pub(super) async fn rename_at(
        &self,
        oldfid: Fid,
        oldname: &str,
        newfid: Fid,
        newname: &str,
        fence: Option<&Fence>,
    ) -> Result<Msg, SigmaError> {
        check_name(oldname)?;
        check_name(newname)?;
        let src = self.sess.fids.lookup(oldfid)?;
        let dst = self.sess.fids.lookup(newfid)?;
        for d in [&src, &dst] {
            if !d.qid.is_dir() {
                return Err(SigmaError::NotDir(d.path_str()));
            }
        }
        let from = path::join(&child(&src.path, oldname));
        let to = child(&dst.path, newname);
        let to_str = path::join(&to);
        let _guards = self.fence_guards(fence, &[from.as_str(), to_str.as_str()]).await?;

        let (sdir, ddir) = (src.qid.path, dst.qid.path);
        let qpath = loop {
            let sl = self.core.store.read_dir(sdir).await?;
            let dversion = if sdir == ddir {
                sl.version
            } else {
                self.core.store.read_dir(ddir).await?.version
            };
            let qpath = sl
                .get(oldname)
                .map(|e| e.qid.path)
                .ok_or_else(|| SigmaError::NotFound(from.clone()))?;
            match self
                .core
                .store
                .rename_at((sdir, sl.version), oldname, (ddir, dversion), newname)
                .await
            {
                Ok(()) => break qpath,
                Err(e) if e.is_version() => continue,
                Err(e) => return Err(e),
            }
        };

        self.sess.move_ephemeral(qpath, EphemeralFile { dir: ddir, path: to });
        self.core.wt.wakeup(sdir).await;
        if ddir != sdir {
            self.core.wt.wakeup(ddir).await;
        }
        Ok(Msg::Rrenameat)
    }

    /// Create-or-open the file at `wnames` and write `data` to it
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn put_file(
        &self,
        fid: Fid,
        wnames: &[String],
        mode: Mode,
        perm: Perm,
        offset: u64,
        data: &[u8],
        lease: Option<LeaseId>,
        fence: Option<&Fence>,
    ) -> Result<Msg, SigmaError> {
        if !mode.can_write() {
            return Err(SigmaError::Inval("put needs write access".into()));
        }
        let st = self.sess.fids.lookup(fid)?;
        let comps = path::resolve(&st.path, wnames);
        let Some((name, dir_comps)) = comps.split_last() else {
            return Err(SigmaError::Inval("cannot put the root".into()));
        };
        check_name(name)?;
        let (dqid, _) = self.resolve(dir_comps).await?;
        if !dqid.is_dir() {
            return Err(SigmaError::NotDir(path::join(dir_comps)));
        }
        let dir = dqid.path;
        let target = path::join(&comps);
        let _guards = self.fence_guards(fence, &[target.as_str()]).await?;

        let file = loop {
            let listing = self.core.store.read_dir(dir).await?;
            if let Some(e) = listing.get(name) {
                if e.qid.is_dir() {
                    return Err(SigmaError::IsDir(target));
                }
                break e.qid.path;
            }
            match self
                .core
                .store
                .create(dir, listing.version, name, perm, lease)
                .await
            {
                Ok(qid) => {
                    if perm.is_ephemeral() {
                        self.sess.add_ephemeral(
                            qid.path,
                            EphemeralFile {
                                dir,
                                path: comps.clone(),
                            },
                        );
                    }
                    self.core.wt.wakeup(dir).await;
                    break qid.path;
                }
                Err(e) if e.is_version() || e.is_exists() => continue,
                Err(e) => return Err(e),
            }
        };

        if mode.contains(Mode::OTRUNC) {
            self.core.store.truncate(file, 0).await?;
        }
        let offset = if mode.contains(Mode::OAPPEND) {
            self.core.store.stat(file).await?.length
        } else {
            offset
        };
        let count = self.core.store.write(file, offset, data).await?;
        Ok(Msg::Rwrite { count })
    }
}
