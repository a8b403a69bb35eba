//! Per-session operation scheduler
//!
//! A [`ThreadMgr`] runs the ops of one session strictly one at a time in
//! arrival order. The running op may `sleep` (waiting on a watch or lock),
//! which hands the manager to the next queued op; when something later
//! `wake`s it, the op is resumed by the run loop before any new op starts.
//!
//! Each op is in one of three states:
//!
//! * running: the run loop is waiting for it to sleep or finish
//! * sleeping: parked on a [`Sleeper`] until its [`Wakeup`] is pushed
//! * done: its task returned and released the run loop
//!
//! Pending wakeups are always drained before new ops are started, so the
//! order in which a session's ops run depends only on the order of its
//! requests and wakeups.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use sigmap::SigmaError;

/// Executes the ops a [`ThreadMgr`] schedules
#[async_trait]
pub trait OpProcessor: Send + Sync + 'static {
    type Op: Send + 'static;

    /// Run one op; `thread` lets it sleep without blocking its session's queue
    async fn process(&self, op: Self::Op, thread: ThreadHandle);
}

/// Resumes exactly one sleeping op
#[derive(Debug)]
pub struct Wakeup(oneshot::Sender<()>);

/// Parks a sleeping op until its [`Wakeup`] is delivered
#[derive(Debug)]
pub struct Sleeper(oneshot::Receiver<()>);

pub fn wakeup_pair() -> (Wakeup, Sleeper) {
    let (tx, rx) = oneshot::channel();
    (Wakeup(tx), Sleeper(rx))
}

type Task = Box<dyn FnOnce(ThreadHandle) -> BoxFuture<'static, ()> + Send>;

struct Queued {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct State {
    ops: VecDeque<Queued>,
    wakeups: VecDeque<Wakeup>,
    numops: u64,
    done: bool,
    exited: bool,
}

#[derive(Default)]
struct Sched {
    state: Mutex<State>,
    /// An op or a wakeup was queued, or the manager was stopped
    runnable: Notify,
    /// The current op slept or finished
    yielded: Notify,
}

/// Handle the running op uses to sleep, and anyone uses to wake it
#[derive(Clone)]
pub struct ThreadHandle {
    sched: Arc<Sched>,
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle").finish_non_exhaustive()
    }
}

impl ThreadHandle {
    /// Yield the session to its next op until `sleeper`'s wakeup is delivered
    ///
    /// Must only be called by the op currently running on this manager.
    pub async fn sleep(&self, sleeper: Sleeper) {
        self.sched.yielded.notify_one();
        if sleeper.0.await.is_err() {
            // wakeup dropped without being sent: rejoin through the run loop
            tracing::error!("sleeping op lost its wakeup");
            let (wakeup, sleeper) = wakeup_pair();
            self.wake(wakeup);
            let _ = sleeper.0.await;
        }
    }

    /// Queue `wakeup` so the run loop resumes its op before starting new ones
    pub fn wake(&self, wakeup: Wakeup) {
        let mut st = self.sched.state.lock();
        if st.exited {
            drop(st);
            tracing::warn!("wake after run loop exit");
            let _ = wakeup.0.send(());
            return;
        }
        st.wakeups.push_back(wakeup);
        drop(st);
        self.sched.runnable.notify_one();
    }
}

/// Releases the run loop when an op's task ends, even by panic or abort
struct YieldOnDrop(Arc<Sched>);

impl Drop for YieldOnDrop {
    fn drop(&mut self) {
        self.0.yielded.notify_one();
    }
}

pub struct ThreadMgr<P: OpProcessor> {
    processor: Arc<P>,
    sched: Arc<Sched>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl<P: OpProcessor> ThreadMgr<P> {
    /// Start the run loop; must be called inside a tokio runtime
    pub fn new(processor: Arc<P>) -> Self {
        let sched = Arc::new(Sched::default());
        let runner = tokio::spawn(run(sched.clone()));
        Self {
            processor,
            sched,
            runner: Mutex::new(Some(runner)),
        }
    }

    /// Enqueue an op, returning its sequence number
    pub fn process(&self, op: P::Op) -> Result<u64, SigmaError> {
        let processor = self.processor.clone();
        let task: Task = Box::new(move |thread: ThreadHandle| -> BoxFuture<'static, ()> {
            Box::pin(async move { processor.process(op, thread).await })
        });

        let mut st = self.sched.state.lock();
        if st.done {
            return Err(SigmaError::Closed("thread manager stopped".into()));
        }
        st.numops += 1;
        let seq = st.numops;
        st.ops.push_back(Queued { seq, task });
        drop(st);

        self.sched.runnable.notify_one();
        Ok(seq)
    }

    /// Refuse new ops; the run loop exits once queued ops and wakeups drain
    pub fn stop(&self) {
        self.sched.state.lock().done = true;
        self.sched.runnable.notify_one();
    }

    /// Wait for the run loop to exit after `stop`
    pub async fn join(&self) {
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            if let Err(e) = runner.await {
                tracing::error!("thread manager run loop failed: {}", e);
            }
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            sched: self.sched.clone(),
        }
    }

    /// Ops accepted so far
    pub fn numops(&self) -> u64 {
        self.sched.state.lock().numops
    }

    pub fn queued(&self) -> usize {
        self.sched.state.lock().ops.len()
    }
}

impl<P: OpProcessor> Drop for ThreadMgr<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Next {
    Resume(Wakeup),
    Start(Queued),
    Idle,
    Exit,
}

async fn run(sched: Arc<Sched>) {
    loop {
        let next = {
            let mut st = sched.state.lock();
            if let Some(w) = st.wakeups.pop_front() {
                Next::Resume(w)
            } else if let Some(q) = st.ops.pop_front() {
                Next::Start(q)
            } else if st.done {
                st.exited = true;
                Next::Exit
            } else {
                Next::Idle
            }
        };

        match next {
            Next::Resume(wakeup) => {
                if wakeup.0.send(()).is_ok() {
                    sched.yielded.notified().await;
                }
            }
            Next::Start(q) => {
                let thread = ThreadHandle {
                    sched: sched.clone(),
                };
                let done = YieldOnDrop(sched.clone());
                let span = tracing::debug_span!("op", seq = q.seq);
                tokio::spawn(
                    async move {
                        let _done = done;
                        (q.task)(thread).await;
                    }
                    .instrument(span),
                );
                sched.yielded.notified().await;
            }
            Next::Idle => sched.runnable.notified().await,
            Next::Exit => return,
        }
    }
}
