//! In-memory storage backend
//!
//! A single mutex guards the whole tree. Every directory carries a version
//! that moves on each change to its entries, and files carry a version that
//! moves on each write, which is all the conditional operations of
//! [`Storage`] need. Lease deadlines use the tokio clock so tests can pause
//! and advance time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use sigmap::{DirEntry, LeaseId, Perm, QType, Qid, Qpath, SigmaError, Stat};

use super::{DirListing, Removed, Storage};

const ROOT: Qpath = Qpath(1);

/// Largest file a [`MemStore`] holds
pub const MAX_FILE_SIZE: u64 = 1 << 30;

/// End of `len` bytes at `offset`, if the file may grow that far
fn file_end(offset: u64, len: usize) -> Result<usize, SigmaError> {
    offset
        .checked_add(len as u64)
        .filter(|end| *end <= MAX_FILE_SIZE)
        .map(|end| end as usize)
        .ok_or_else(|| SigmaError::Inval(format!("file would exceed {MAX_FILE_SIZE} bytes")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    name: String,
    parent: Qpath,
    perm: Perm,
    version: u32,
    data: Vec<u8>,
    entries: BTreeMap<String, Qpath>,
    lease: Option<LeaseId>,
}

impl Node {
    fn qid(&self, path: Qpath) -> Qid {
        Qid {
            kind: if self.perm.is_dir() {
                QType::Dir
            } else {
                QType::File
            },
            version: self.version,
            path,
        }
    }
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    files: HashSet<Qpath>,
}

/// A lease as stored in a snapshot, with the time it had left
#[derive(Debug, Serialize, Deserialize)]
struct LeaseImage {
    id: LeaseId,
    ttl: Duration,
    left: Duration,
    files: Vec<Qpath>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeImage {
    nodes: Vec<(Qpath, Node)>,
    leases: Vec<LeaseImage>,
    next_qpath: u64,
    next_lease: u64,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<Qpath, Node>,
    leases: HashMap<LeaseId, Lease>,
    next_qpath: u64,
    next_lease: u64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            Node {
                name: String::new(),
                parent: ROOT,
                perm: Perm(0o777) | Perm::DMDIR,
                version: 0,
                data: Vec::new(),
                entries: BTreeMap::new(),
                lease: None,
            },
        );
        Self {
            nodes,
            leases: HashMap::new(),
            next_qpath: ROOT.0,
            next_lease: 0,
        }
    }

    fn node(&self, qpath: Qpath) -> Result<&Node, SigmaError> {
        self.nodes
            .get(&qpath)
            .ok_or_else(|| SigmaError::NotFound(format!("qpath {qpath}")))
    }

    fn node_mut(&mut self, qpath: Qpath) -> Result<&mut Node, SigmaError> {
        self.nodes
            .get_mut(&qpath)
            .ok_or_else(|| SigmaError::NotFound(format!("qpath {qpath}")))
    }

    fn dir(&self, qpath: Qpath) -> Result<&Node, SigmaError> {
        let n = self.node(qpath)?;
        if !n.perm.is_dir() {
            return Err(SigmaError::NotDir(n.name.clone()));
        }
        Ok(n)
    }

    fn file_mut(&mut self, qpath: Qpath) -> Result<&mut Node, SigmaError> {
        let n = self.node_mut(qpath)?;
        if n.perm.is_dir() {
            return Err(SigmaError::IsDir(n.name.clone()));
        }
        Ok(n)
    }

    /// Directory at the version the caller computed its change against
    fn dir_at(&self, qpath: Qpath, version: u32) -> Result<&Node, SigmaError> {
        let d = self.dir(qpath)?;
        if d.version != version {
            return Err(SigmaError::Version(format!(
                "dir {} at {} not {}",
                qpath, d.version, version
            )));
        }
        Ok(d)
    }

    fn live_lease(&self, lease: LeaseId, now: Instant) -> Result<&Lease, SigmaError> {
        match self.leases.get(&lease) {
            Some(l) if l.deadline > now => Ok(l),
            Some(_) => Err(SigmaError::Stale(format!("lease {lease} expired"))),
            None => Err(SigmaError::Stale(format!("lease {lease} unknown"))),
        }
    }

    /// Unlink `name` from `dir`, dropping its node and lease binding
    ///
    /// Leaves the directory version alone.
    fn unlink(&mut self, dir: Qpath, name: &str) -> Result<Qpath, SigmaError> {
        let qpath = self
            .node_mut(dir)?
            .entries
            .remove(name)
            .ok_or_else(|| SigmaError::NotFound(name.to_string()))?;
        if let Some(node) = self.nodes.remove(&qpath) {
            if let Some(l) = node.lease.and_then(|id| self.leases.get_mut(&id)) {
                l.files.remove(&qpath);
            }
        }
        Ok(qpath)
    }

    fn end_lease(&mut self, id: LeaseId) -> Vec<Removed> {
        let Some(lease) = self.leases.remove(&id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for qpath in lease.files {
            let Some(node) = self.nodes.get(&qpath) else {
                continue;
            };
            let (dir, name) = (node.parent, node.name.clone());
            if self.unlink(dir, &name).is_ok() {
                if let Ok(d) = self.node_mut(dir) {
                    d.version += 1;
                }
                removed.push(Removed { dir, name, qpath });
            }
        }
        removed
    }

    fn image(&self, now: Instant) -> TreeImage {
        let mut nodes: Vec<(Qpath, Node)> =
            self.nodes.iter().map(|(q, n)| (*q, n.clone())).collect();
        nodes.sort_by_key(|(q, _)| *q);
        let mut leases: Vec<LeaseImage> = self
            .leases
            .iter()
            .map(|(id, l)| {
                let mut files: Vec<Qpath> = l.files.iter().copied().collect();
                files.sort();
                LeaseImage {
                    id: *id,
                    ttl: l.ttl,
                    left: l.deadline.saturating_duration_since(now),
                    files,
                }
            })
            .collect();
        leases.sort_by_key(|l| l.id);
        TreeImage {
            nodes,
            leases,
            next_qpath: self.next_qpath,
            next_lease: self.next_lease,
        }
    }

    fn from_image(image: TreeImage, now: Instant) -> Result<Self, SigmaError> {
        let nodes: HashMap<Qpath, Node> = image.nodes.into_iter().collect();
        if !nodes.get(&ROOT).is_some_and(|n| n.perm.is_dir()) {
            return Err(SigmaError::Inval("snapshot has no root directory".into()));
        }
        let leases = image
            .leases
            .into_iter()
            .map(|l| {
                (
                    l.id,
                    Lease {
                        ttl: l.ttl,
                        deadline: now + l.left,
                        files: l.files.into_iter().collect(),
                    },
                )
            })
            .collect();
        Ok(Self {
            nodes,
            leases,
            next_qpath: image.next_qpath,
            next_lease: image.next_lease,
        })
    }

    /// Make room for `to` in `dir`: nothing there, or a file to replace
    fn clear_target(&mut self, dir: Qpath, to: &str) -> Result<(), SigmaError> {
        let Some(&existing) = self.dir(dir)?.entries.get(to) else {
            return Ok(());
        };
        if self.node(existing)?.perm.is_dir() {
            return Err(SigmaError::Exists(to.to_string()));
        }
        self.unlink(dir, to)?;
        Ok(())
    }
}

/// Volatile [`Storage`] with leases
pub struct MemStore {
    tree: Mutex<Tree>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self {
            tree: Mutex::new(Tree::new()),
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leases(&self) -> usize {
        self.tree.lock().leases.len()
    }
}

#[async_trait]
impl Storage for MemStore {
    fn root(&self) -> Qid {
        let tree = self.tree.lock();
        Qid {
            kind: QType::Dir,
            version: tree.nodes.get(&ROOT).map(|n| n.version).unwrap_or(0),
            path: ROOT,
        }
    }

    async fn stat(&self, qpath: Qpath) -> Result<Stat, SigmaError> {
        let tree = self.tree.lock();
        let n = tree.node(qpath)?;
        Ok(Stat {
            qid: n.qid(qpath),
            perm: n.perm,
            length: n.data.len() as u64,
            name: n.name.clone(),
        })
    }

    async fn lookup(&self, dir: Qpath, name: &str) -> Result<Qid, SigmaError> {
        let tree = self.tree.lock();
        let qpath = *tree
            .dir(dir)?
            .entries
            .get(name)
            .ok_or_else(|| SigmaError::NotFound(name.to_string()))?;
        Ok(tree.node(qpath)?.qid(qpath))
    }

    async fn read_dir(&self, dir: Qpath) -> Result<DirListing, SigmaError> {
        let tree = self.tree.lock();
        let d = tree.dir(dir)?;
        let entries = d
            .entries
            .iter()
            .map(|(name, &qpath)| {
                Ok(DirEntry {
                    name: name.clone(),
                    qid: tree.node(qpath)?.qid(qpath),
                })
            })
            .collect::<Result<Vec<_>, SigmaError>>()?;
        Ok(DirListing {
            version: d.version,
            entries,
        })
    }

    async fn create(
        &self,
        dir: Qpath,
        version: u32,
        name: &str,
        perm: Perm,
        lease: Option<LeaseId>,
    ) -> Result<Qid, SigmaError> {
        let mut tree = self.tree.lock();
        if tree.dir_at(dir, version)?.entries.contains_key(name) {
            return Err(SigmaError::Exists(name.to_string()));
        }
        if let Some(id) = lease {
            tree.live_lease(id, Instant::now())?;
        }

        tree.next_qpath += 1;
        let qpath = Qpath(tree.next_qpath);
        let node = Node {
            name: name.to_string(),
            parent: dir,
            perm,
            version: 0,
            data: Vec::new(),
            entries: BTreeMap::new(),
            lease,
        };
        let qid = node.qid(qpath);
        tree.nodes.insert(qpath, node);
        if let Some(l) = lease.and_then(|id| tree.leases.get_mut(&id)) {
            l.files.insert(qpath);
        }
        let d = tree.node_mut(dir)?;
        d.entries.insert(name.to_string(), qpath);
        d.version += 1;

        debug!(%dir, name, %qpath, "created");
        Ok(qid)
    }

    async fn remove(&self, dir: Qpath, version: u32, name: &str) -> Result<Qpath, SigmaError> {
        let mut tree = self.tree.lock();
        let qpath = *tree
            .dir_at(dir, version)?
            .entries
            .get(name)
            .ok_or_else(|| SigmaError::NotFound(name.to_string()))?;
        if !tree.node(qpath)?.entries.is_empty() {
            return Err(SigmaError::NotEmpty(name.to_string()));
        }
        tree.unlink(dir, name)?;
        tree.node_mut(dir)?.version += 1;
        Ok(qpath)
    }

    async fn rename(
        &self,
        dir: Qpath,
        version: u32,
        from: &str,
        to: &str,
    ) -> Result<(), SigmaError> {
        self.rename_at((dir, version), from, (dir, version), to).await
    }

    async fn rename_at(
        &self,
        src: (Qpath, u32),
        from: &str,
        dst: (Qpath, u32),
        to: &str,
    ) -> Result<(), SigmaError> {
        let mut tree = self.tree.lock();
        let qpath = *tree
            .dir_at(src.0, src.1)?
            .entries
            .get(from)
            .ok_or_else(|| SigmaError::NotFound(from.to_string()))?;
        tree.dir_at(dst.0, dst.1)?;
        if src.0 == dst.0 && from == to {
            return Ok(());
        }
        tree.clear_target(dst.0, to)?;

        let s = tree.node_mut(src.0)?;
        s.entries.remove(from);
        s.version += 1;
        let d = tree.node_mut(dst.0)?;
        d.entries.insert(to.to_string(), qpath);
        if src.0 != dst.0 {
            d.version += 1;
        }
        let n = tree.node_mut(qpath)?;
        n.name = to.to_string();
        n.parent = dst.0;
        Ok(())
    }

    async fn read(&self, file: Qpath, offset: u64, count: u32) -> Result<Vec<u8>, SigmaError> {
        let tree = self.tree.lock();
        let n = tree.node(file)?;
        if n.perm.is_dir() {
            return Err(SigmaError::IsDir(n.name.clone()));
        }
        let start = (offset as usize).min(n.data.len());
        let end = start.saturating_add(count as usize).min(n.data.len());
        Ok(n.data[start..end].to_vec())
    }

    async fn write(&self, file: Qpath, offset: u64, data: &[u8]) -> Result<u32, SigmaError> {
        let mut tree = self.tree.lock();
        let end = file_end(offset, data.len())?;
        let start = end - data.len();
        let n = tree.file_mut(file)?;
        if n.data.len() < end {
            n.data.resize(end, 0);
        }
        n.data[start..end].copy_from_slice(data);
        n.version += 1;
        Ok(data.len() as u32)
    }

    async fn truncate(&self, file: Qpath, length: u64) -> Result<(), SigmaError> {
        let mut tree = self.tree.lock();
        let length = file_end(length, 0)?;
        let n = tree.file_mut(file)?;
        n.data.resize(length, 0);
        n.version += 1;
        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, SigmaError> {
        if ttl.is_zero() {
            return Err(SigmaError::Inval("zero lease ttl".into()));
        }
        let mut tree = self.tree.lock();
        tree.next_lease += 1;
        let id = LeaseId(tree.next_lease);
        tree.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                files: HashSet::new(),
            },
        );
        debug!(lease = %id, ?ttl, "lease granted");
        Ok(id)
    }

    async fn renew_lease(&self, lease: LeaseId) -> Result<(), SigmaError> {
        let mut tree = self.tree.lock();
        let now = Instant::now();
        let ttl = tree.live_lease(lease, now)?.ttl;
        if let Some(l) = tree.leases.get_mut(&lease) {
            l.deadline = now + ttl;
        }
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<Vec<Removed>, SigmaError> {
        let mut tree = self.tree.lock();
        if !tree.leases.contains_key(&lease) {
            return Err(SigmaError::Stale(format!("lease {lease} unknown")));
        }
        Ok(tree.end_lease(lease))
    }

    async fn snapshot(&self) -> Result<Vec<u8>, SigmaError> {
        let image = self.tree.lock().image(Instant::now());
        Ok(bincode::serialize(&image)?)
    }

    async fn restore(&self, snapshot: &[u8]) -> Result<(), SigmaError> {
        let image: TreeImage = bincode::deserialize(snapshot)?;
        let tree = Tree::from_image(image, Instant::now())?;
        debug!(nodes = tree.nodes.len(), leases = tree.leases.len(), "tree restored");
        *self.tree.lock() = tree;
        Ok(())
    }

    async fn expire_leases(&self) -> Result<Vec<Removed>, SigmaError> {
        let mut tree = self.tree.lock();
        let now = Instant::now();
        let expired: Vec<LeaseId> = tree
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut removed = Vec::new();
        for id in expired {
            debug!(lease = %id, "lease expired");
            removed.extend(tree.end_lease(id));
        }
        Ok(removed)
    }
}
