//! Storage backend interface
//!
//! The protocol server keeps no file data of its own. Everything lives
//! behind [`Storage`], which hands out directory listings with versions and
//! accepts conditional updates: a create, remove or rename names the
//! directory version it was computed against and fails with a version error
//! if the directory changed since. Callers re-read and retry.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sigmap::{DirEntry, LeaseId, Perm, Qid, Qpath, SigmaError, Stat};

pub mod mem;

pub use mem::MemStore;

/// Snapshot of a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListing {
    pub version: u32,
    /// Sorted by name
    pub entries: Vec<DirEntry>,
}

impl DirListing {
    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// A file the backend deleted on its own, e.g. when its lease ran out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub dir: Qpath,
    pub name: String,
    pub qpath: Qpath,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    fn root(&self) -> Qid;

    async fn stat(&self, qpath: Qpath) -> Result<Stat, SigmaError>;

    async fn lookup(&self, dir: Qpath, name: &str) -> Result<Qid, SigmaError>;

    async fn read_dir(&self, dir: Qpath) -> Result<DirListing, SigmaError>;

    /// Create `name` in `dir`, provided `dir` is still at `version`
    ///
    /// A file bound to `lease` is removed when the lease expires.
    async fn create(
        &self,
        dir: Qpath,
        version: u32,
        name: &str,
        perm: Perm,
        lease: Option<LeaseId>,
    ) -> Result<Qid, SigmaError>;

    async fn remove(&self, dir: Qpath, version: u32, name: &str) -> Result<Qpath, SigmaError>;

    /// Rename within one directory, replacing a file named `to`
    async fn rename(&self, dir: Qpath, version: u32, from: &str, to: &str)
        -> Result<(), SigmaError>;

    /// Move `from` in `src` to `to` in `dst`; each directory is checked
    /// against its own expected version
    async fn rename_at(
        &self,
        src: (Qpath, u32),
        from: &str,
        dst: (Qpath, u32),
        to: &str,
    ) -> Result<(), SigmaError>;

    async fn read(&self, file: Qpath, offset: u64, count: u32) -> Result<Vec<u8>, SigmaError>;

    async fn write(&self, file: Qpath, offset: u64, data: &[u8]) -> Result<u32, SigmaError>;

    async fn truncate(&self, file: Qpath, length: u64) -> Result<(), SigmaError>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, SigmaError>;

    async fn renew_lease(&self, lease: LeaseId) -> Result<(), SigmaError>;

    /// End `lease` now, removing its files
    async fn revoke_lease(&self, lease: LeaseId) -> Result<Vec<Removed>, SigmaError>;

    /// End every lease past its deadline, removing their files
    async fn expire_leases(&self) -> Result<Vec<Removed>, SigmaError>;

    /// Encode the whole tree, leases included
    async fn snapshot(&self) -> Result<Vec<u8>, SigmaError>;

    /// Replace the whole tree with one encoded by [`Storage::snapshot`]
    async fn restore(&self, snapshot: &[u8]) -> Result<(), SigmaError>;
}
