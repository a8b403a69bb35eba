//! Session-aware condition variables
//!
//! A [`SessCond`] is a condition variable whose waiters are grouped by
//! session. When a session goes away, [`SessCondTable::delete_sess`] wakes
//! every waiter of that session with a closed error instead of leaving it
//! blocked forever. Waiting goes through the session's [`ThreadHandle`], so a
//! blocked op never holds up the other ops of its session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use sigmap::{SessionId, SigmaError};

use crate::threadmgr::{wakeup_pair, ThreadHandle, Wakeup};

#[derive(Default)]
struct TableState {
    next_id: u64,
    conds: HashMap<u64, Weak<SessCond>>,
    /// Sessions being torn down; waits on their behalf fail at once
    closed: HashSet<SessionId>,
}

/// All live conds of one server
#[derive(Default)]
pub struct SessCondTable {
    state: Arc<Mutex<TableState>>,
}

impl SessCondTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_sess_cond(&self) -> Arc<SessCond> {
        let mut st = self.state.lock();
        st.next_id += 1;
        let cond = Arc::new(SessCond {
            id: st.next_id,
            table: self.state.clone(),
            state: Mutex::new(CondState::default()),
        });
        st.conds.insert(cond.id, Arc::downgrade(&cond));
        cond
    }

    pub fn free_sess_cond(&self, cond: &SessCond) {
        self.state.lock().conds.remove(&cond.id);
    }

    /// Force-wake every waiter of `sid` with a closed error
    ///
    /// The affected conds are collected under the table lock, which is
    /// released before any cond lock is taken. Returns how many waiters
    /// were marked closed.
    pub fn delete_sess(&self, sid: SessionId) -> usize {
        let conds: Vec<Arc<SessCond>> = {
            let mut st = self.state.lock();
            st.closed.insert(sid);
            st.conds.values().filter_map(Weak::upgrade).collect()
        };
        let n = conds.iter().map(|c| c.closed(sid)).sum();
        tracing::debug!(%sid, conds = conds.len(), woken = n, "closed session conds");
        n
    }

    /// Drop the closed marker once the session is gone for good
    pub fn forget_sess(&self, sid: SessionId) {
        self.state.lock().closed.remove(&sid);
    }

    pub fn len(&self) -> usize {
        self.state.lock().conds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Waiter {
    id: u64,
    sid: SessionId,
    thread: ThreadHandle,
    wakeup: Wakeup,
}

/// A signalled waiter that has not resumed yet
struct Waking {
    sid: SessionId,
    closed: bool,
}

#[derive(Default)]
struct CondState {
    next_waiter: u64,
    waiting: VecDeque<Waiter>,
    waking: HashMap<u64, Waking>,
}

pub struct SessCond {
    id: u64,
    table: Arc<Mutex<TableState>>,
    state: Mutex<CondState>,
}

impl SessCond {
    /// Release `guard`, sleep until signalled, then re-acquire the lock
    ///
    /// Registration happens while `guard` is still held, so a signaller that
    /// takes the same lock cannot miss this waiter. Returns `Closed` (without
    /// the lock) if the wakeup came from session teardown.
    pub async fn wait<T: Send>(
        &self,
        sid: SessionId,
        thread: &ThreadHandle,
        guard: OwnedMutexGuard<T>,
    ) -> Result<OwnedMutexGuard<T>, SigmaError> {
        let lock = OwnedMutexGuard::mutex(&guard).clone();
        let (wakeup, sleeper) = wakeup_pair();
        let id = {
            let mut st = self.state.lock();
            if self.table.lock().closed.contains(&sid) {
                return Err(SigmaError::Closed(format!("session {sid}")));
            }
            st.next_waiter += 1;
            let id = st.next_waiter;
            st.waiting.push_back(Waiter {
                id,
                sid,
                thread: thread.clone(),
                wakeup,
            });
            id
        };
        drop(guard);

        thread.sleep(sleeper).await;

        let closed = self
            .state
            .lock()
            .waking
            .remove(&id)
            .map(|w| w.closed)
            .unwrap_or(false);
        if closed {
            return Err(SigmaError::Closed(format!("session {sid}")));
        }
        Ok(lock.lock_owned().await)
    }

    /// Wake the longest-waiting waiter; false if there was none
    pub fn signal(&self) -> bool {
        let mut st = self.state.lock();
        match st.waiting.pop_front() {
            Some(w) => {
                st.waking.insert(
                    w.id,
                    Waking {
                        sid: w.sid,
                        closed: false,
                    },
                );
                w.thread.wake(w.wakeup);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter, returning how many there were
    pub fn broadcast(&self) -> usize {
        let mut st = self.state.lock();
        let waiters: Vec<Waiter> = st.waiting.drain(..).collect();
        let n = waiters.len();
        for w in waiters {
            st.waking.insert(
                w.id,
                Waking {
                    sid: w.sid,
                    closed: false,
                },
            );
            w.thread.wake(w.wakeup);
        }
        n
    }

    fn closed(&self, sid: SessionId) -> usize {
        let mut st = self.state.lock();
        let mut n = 0;
        for w in st.waking.values_mut().filter(|w| w.sid == sid) {
            w.closed = true;
            n += 1;
        }

        let (mine, others): (VecDeque<Waiter>, VecDeque<Waiter>) =
            st.waiting.drain(..).partition(|w| w.sid == sid);
        st.waiting = others;
        for w in mine {
            st.waking.insert(w.id, Waking { sid, closed: true });
            w.thread.wake(w.wakeup);
            n += 1;
        }
        n
    }

    /// Waiters not yet signalled
    pub fn waiters(&self) -> usize {
        self.state.lock().waiting.len()
    }
}
