//! Tag to pending-reply table

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use sigmap::{SigmaError, Tag};

/// Where a matched reply (or the failure standing in for it) is delivered
pub type ReplyTx<C> = oneshot::Sender<Result<C, SigmaError>>;

#[derive(Debug)]
struct State<C> {
    closed: bool,
    calls: HashMap<Tag, ReplyTx<C>>,
}

/// Outstanding calls keyed by tag
///
/// `remove` is the only way an entry leaves the table, so whichever of the
/// reader, the close path or a failed writer removes a tag first is the one
/// that answers it.
#[derive(Debug)]
pub struct CallMap<C> {
    state: Mutex<State<C>>,
}

impl<C> Default for CallMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CallMap<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                closed: false,
                calls: HashMap::new(),
            }),
        }
    }

    pub fn put(&self, tag: Tag, tx: ReplyTx<C>) -> Result<(), SigmaError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(SigmaError::Unreachable("connection closed".into()));
        }
        if st.calls.contains_key(&tag) {
            return Err(SigmaError::DupTag(tag));
        }
        st.calls.insert(tag, tx);
        Ok(())
    }

    pub fn remove(&self, tag: Tag) -> Option<ReplyTx<C>> {
        self.state.lock().calls.remove(&tag)
    }

    /// Refuse new calls and return the tags still waiting for a reply
    ///
    /// Entries stay in the table so the caller can `remove` and fail each
    /// one. A second close returns nothing.
    pub fn close(&self) -> Vec<Tag> {
        let mut st = self.state.lock();
        if st.closed {
            return Vec::new();
        }
        st.closed = true;
        st.calls.keys().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().calls.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_duplicate_tag_rejected() {
        let cm: CallMap<()> = CallMap::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        cm.put(Tag(1), tx1).unwrap();
        assert_eq!(cm.put(Tag(1), tx2).unwrap_err(), SigmaError::DupTag(Tag(1)));
        assert_eq!(cm.outstanding(), 1);
    }

    #[test]
    fn test_second_remove_finds_nothing() {
        let cm: CallMap<()> = CallMap::new();
        let (tx, _rx) = oneshot::channel();
        cm.put(Tag(5), tx).unwrap();
        assert!(cm.remove(Tag(5)).is_some());
        assert!(cm.remove(Tag(5)).is_none());
    }

    #[test]
    fn test_close_snapshots_and_refuses() {
        let cm: CallMap<()> = CallMap::new();
        for t in 0..3 {
            let (tx, _rx) = oneshot::channel();
            cm.put(Tag(t), tx).unwrap();
        }
        let mut tags = cm.close();
        tags.sort();
        assert_eq!(tags, vec![Tag(0), Tag(1), Tag(2)]);
        assert!(cm.is_closed());
        assert!(cm.close().is_empty());

        let (tx, _rx) = oneshot::channel();
        assert!(cm.put(Tag(9), tx).unwrap_err().is_unreachable());
        // closed entries can still be drained
        assert!(cm.remove(Tag(1)).is_some());
    }

    #[test]
    fn test_racing_removes_match_each_tag_once() {
        const N: u64 = 512;
        let cm: Arc<CallMap<()>> = Arc::new(CallMap::new());

        let putters: Vec<_> = (0..4)
            .map(|w| {
                let cm = cm.clone();
                std::thread::spawn(move || {
                    for t in (w..N).step_by(4) {
                        let (tx, _rx) = oneshot::channel();
                        cm.put(Tag(t), tx).unwrap();
                    }
                })
            })
            .collect();
        for p in putters {
            p.join().unwrap();
        }

        let wins = Arc::new(AtomicUsize::new(0));
        let removers: Vec<_> = (0..8)
            .map(|_| {
                let cm = cm.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    for t in 0..N {
                        if cm.remove(Tag(t)).is_some() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for r in removers {
            r.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), N as usize);
        assert_eq!(cm.outstanding(), 0);
    }
}
