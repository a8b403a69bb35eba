//! Per-session fid table

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sigmap::{path, Fid, Mode, Qid, Qpath, SigmaError};

/// What a fid is bound to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FidState {
    pub path: Vec<String>,
    pub qid: Qid,
    /// Directory holding the object; the root is its own parent
    pub parent: Qpath,
    /// Set once the fid is opened
    pub mode: Option<Mode>,
    /// Directory version the fid last observed, for watches
    pub seen: Option<u32>,
}

impl FidState {
    pub fn new(path: Vec<String>, qid: Qid, parent: Qpath) -> Self {
        Self {
            path,
            qid,
            parent,
            mode: None,
            seen: None,
        }
    }

    pub fn path_str(&self) -> String {
        path::join(&self.path)
    }

    /// Last path component; `None` for the root
    pub fn name(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct FidTable {
    fids: Mutex<HashMap<Fid, FidState>>,
}

impl FidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fid: Fid, st: FidState) -> Result<(), SigmaError> {
        if fid == Fid::NONE {
            return Err(SigmaError::Inval("reserved fid".into()));
        }
        let mut fids = self.fids.lock();
        if fids.contains_key(&fid) {
            return Err(SigmaError::Inval(format!("fid {fid} in use")));
        }
        fids.insert(fid, st);
        Ok(())
    }

    pub fn lookup(&self, fid: Fid) -> Result<FidState, SigmaError> {
        self.fids
            .lock()
            .get(&fid)
            .cloned()
            .ok_or(SigmaError::UnknownFid(fid))
    }

    pub fn update(&self, fid: Fid, f: impl FnOnce(&mut FidState)) -> Result<(), SigmaError> {
        let mut fids = self.fids.lock();
        let st = fids.get_mut(&fid).ok_or(SigmaError::UnknownFid(fid))?;
        f(st);
        Ok(())
    }

    pub fn remove(&self, fid: Fid) -> Result<FidState, SigmaError> {
        self.fids.lock().remove(&fid).ok_or(SigmaError::UnknownFid(fid))
    }

    pub fn drain(&self) -> Vec<(Fid, FidState)> {
        self.fids.lock().drain().collect()
    }

    /// Every bound fid, in fid order
    pub fn all(&self) -> Vec<(Fid, FidState)> {
        let mut all: Vec<(Fid, FidState)> =
            self.fids.lock().iter().map(|(f, s)| (*f, s.clone())).collect();
        all.sort_by_key(|(f, _)| *f);
        all
    }

    pub fn restore(&self, fids: Vec<(Fid, FidState)>) {
        let mut table = self.fids.lock();
        table.clear();
        table.extend(fids);
    }

    pub fn len(&self) -> usize {
        self.fids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
