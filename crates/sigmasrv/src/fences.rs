//! Fence tracking
//!
//! [`RecentTable`] is the server-wide record of the newest epoch seen for
//! each fenced path. A fenced write must present exactly that epoch and
//! holds a [`FenceGuard`] while it runs, so a newer fence cannot be
//! installed halfway through a write admitted under the older one.
//!
//! [`FenceTable`] is the per-session set of fences a client registered with
//! `Tfence`; they apply to every mutation under their path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use sigmap::{path, Epoch, Fence, FenceId, SigmaError};

#[derive(Debug, Default)]
pub struct RecentTable {
    fences: Mutex<HashMap<String, Arc<RwLock<Epoch>>>>,
}

/// Holds a fence's epoch steady for the duration of one write
#[derive(Debug)]
pub struct FenceGuard {
    _epoch: OwnedRwLockReadGuard<Epoch>,
}

impl RecentTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, p: &str) -> Arc<RwLock<Epoch>> {
        self.fences
            .lock()
            .entry(path::normalize(p))
            .or_insert_with(|| Arc::new(RwLock::new(Epoch::NONE)))
            .clone()
    }

    /// Record `fence` as current for its path
    ///
    /// Waits for writes admitted under the previous epoch to finish.
    pub async fn fence(&self, fence: &Fence) -> Result<(), SigmaError> {
        let entry = self.entry(&fence.id.path);
        let mut cur = entry.write().await;
        if fence.epoch < *cur {
            return Err(SigmaError::Stale(format!(
                "fence {} older than epoch {}",
                fence, *cur
            )));
        }
        if fence.epoch > *cur {
            tracing::debug!(fence = %fence, prev = %*cur, "new fence");
            *cur = fence.epoch;
        }
        Ok(())
    }

    /// Admit a write to `target` under `fence`
    ///
    /// The fence must cover `target`. An older epoch than the recorded one
    /// is stale; a newer one becomes the record first.
    pub async fn check(&self, fence: &Fence, target: &str) -> Result<FenceGuard, SigmaError> {
        if !fence.covers(target) {
            return Err(SigmaError::Inval(format!(
                "fence {} does not cover {}",
                fence, target
            )));
        }
        let entry = self.entry(&fence.id.path);
        loop {
            let cur = entry.clone().read_owned().await;
            if fence.epoch == *cur {
                return Ok(FenceGuard { _epoch: cur });
            }
            if fence.epoch < *cur {
                return Err(SigmaError::Stale(format!(
                    "fence {} older than epoch {}",
                    fence, *cur
                )));
            }
            drop(cur);
            self.fence(fence).await?;
        }
    }

    pub async fn current(&self, p: &str) -> Option<Epoch> {
        let entry = self.fences.lock().get(&path::normalize(p)).cloned()?;
        let epoch = *entry.read().await;
        Some(epoch)
    }

    /// Every recorded fence, sorted by path
    ///
    /// Waits out writes admitted under the recorded epochs.
    pub async fn snapshot(&self) -> Vec<Fence> {
        let entries: Vec<(String, Arc<RwLock<Epoch>>)> = self
            .fences
            .lock()
            .iter()
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        let mut fences = Vec::with_capacity(entries.len());
        for (p, entry) in entries {
            let epoch = *entry.read().await;
            fences.push(Fence {
                id: FenceId::new(&p),
                epoch,
            });
        }
        fences.sort_by(|a, b| a.id.cmp(&b.id));
        fences
    }

    /// Replace the table's contents with `fences`
    pub fn restore(&self, fences: Vec<Fence>) {
        let mut table = self.fences.lock();
        table.clear();
        for f in fences {
            table.insert(f.id.path, Arc::new(RwLock::new(f.epoch)));
        }
    }
}

/// Fences a session registered, keyed by fence id
///
/// A fence id names one path, so a path holds at most one fence and a
/// newer epoch replaces the registered one.
#[derive(Debug, Default)]
pub struct FenceTable {
    fences: Mutex<BTreeMap<FenceId, Fence>>,
}

impl FenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fence: Fence) -> Result<(), SigmaError> {
        let fence = Fence {
            id: FenceId::new(&fence.id.path),
            epoch: fence.epoch,
        };
        let mut fences = self.fences.lock();
        if let Some(old) = fences.get(&fence.id) {
            if old.epoch > fence.epoch {
                return Err(SigmaError::Stale(format!(
                    "fence {} older than registered {}",
                    fence, old
                )));
            }
        }
        fences.insert(fence.id.clone(), fence);
        Ok(())
    }

    pub fn del(&self, id: &FenceId) -> Result<Fence, SigmaError> {
        self.fences
            .lock()
            .remove(&FenceId::new(&id.path))
            .ok_or_else(|| SigmaError::UnknownFence(id.path.clone()))
    }

    pub fn present(&self, id: &FenceId) -> bool {
        self.fences.lock().contains_key(&FenceId::new(&id.path))
    }

    /// Registered fences covering `target`, outermost first
    pub fn fences(&self, target: &str) -> Vec<Fence> {
        self.fences
            .lock()
            .values()
            .filter(|f| f.covers(target))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Fence> {
        self.fences.lock().values().cloned().collect()
    }

    pub fn restore(&self, fences: Vec<Fence>) {
        let mut table = self.fences.lock();
        table.clear();
        table.extend(fences.into_iter().map(|f| (f.id.clone(), f)));
    }

    pub fn len(&self) -> usize {
        self.fences.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_stale_epoch_rejected_after_newer_fence() {
        let rt = RecentTable::new();
        let target = "/cfg/leader";

        rt.fence(&Fence::new("/cfg", 1)).await.unwrap();
        let g = rt.check(&Fence::new("/cfg", 1), target).await.unwrap();
        drop(g);

        rt.fence(&Fence::new("/cfg", 2)).await.unwrap();
        let g = rt.check(&Fence::new("/cfg", 2), target).await.unwrap();
        drop(g);

        let err = rt.check(&Fence::new("/cfg", 1), target).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(rt.current("/cfg").await, Some(Epoch(2)));
    }

    #[tokio::test]
    async fn test_newer_presented_fence_is_recorded() {
        let rt = RecentTable::new();
        rt.check(&Fence::new("/cfg", 4), "/cfg").await.unwrap();
        assert_eq!(rt.current("/cfg").await, Some(Epoch(4)));
        assert!(rt.fence(&Fence::new("/cfg", 3)).await.unwrap_err().is_stale());
    }

    #[tokio::test]
    async fn test_fence_must_cover_target() {
        let rt = RecentTable::new();
        let err = rt.check(&Fence::new("/cfg", 1), "/other").await.unwrap_err();
        assert!(matches!(err, SigmaError::Inval(_)));
    }

    #[tokio::test]
    async fn test_new_fence_waits_for_admitted_write() {
        let rt = Arc::new(RecentTable::new());
        let guard = rt.check(&Fence::new("/cfg", 1), "/cfg/x").await.unwrap();

        let advance = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.fence(&Fence::new("/cfg", 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!advance.is_finished());

        drop(guard);
        advance.await.unwrap().unwrap();
        assert_eq!(rt.current("/cfg").await, Some(Epoch(2)));
    }

    #[test]
    fn test_fence_table_ancestors() {
        let ft = FenceTable::new();
        ft.insert(Fence::new("/", 1)).unwrap();
        ft.insert(Fence::new("/a", 2)).unwrap();
        ft.insert(Fence::new("/b", 3)).unwrap();

        let covering: Vec<String> = ft.fences("/a/x").into_iter().map(|f| f.id.path).collect();
        assert_eq!(covering, vec!["/".to_string(), "/a".to_string()]);
        assert!(ft.present(&FenceId::new("/b")));
    }

    #[test]
    fn test_fence_table_del() {
        let ft = FenceTable::new();
        ft.insert(Fence::new("/a", 2)).unwrap();
        assert!(ft.insert(Fence::new("/a", 1)).unwrap_err().is_stale());
        assert_eq!(ft.del(&FenceId::new("/a")).unwrap().epoch, Epoch(2));
        assert_eq!(
            ft.del(&FenceId::new("/a")).unwrap_err(),
            SigmaError::UnknownFence("/a".into())
        );
        assert!(ft.is_empty());
    }

    #[tokio::test]
    async fn test_unnormalized_fence_shares_the_record() {
        let rt = RecentTable::new();
        let raw = Fence {
            id: FenceId {
                path: "cfg/".into(),
            },
            epoch: Epoch(5),
        };
        rt.fence(&raw).await.unwrap();
        assert_eq!(rt.current("/cfg").await, Some(Epoch(5)));
        assert!(rt
            .check(&Fence::new("/cfg", 4), "/cfg/x")
            .await
            .unwrap_err()
            .is_stale());
    }

    #[tokio::test]
    async fn test_recent_table_snapshot_restore() {
        let rt = RecentTable::new();
        rt.fence(&Fence::new("/b", 2)).await.unwrap();
        rt.fence(&Fence::new("/a", 7)).await.unwrap();
        let snap = rt.snapshot().await;
        assert_eq!(snap, vec![Fence::new("/a", 7), Fence::new("/b", 2)]);

        let other = RecentTable::new();
        other.fence(&Fence::new("/gone", 1)).await.unwrap();
        other.restore(snap);
        assert_eq!(other.current("/a").await, Some(Epoch(7)));
        assert_eq!(other.current("/gone").await, None);
    }
}
