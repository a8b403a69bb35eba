//! At-most-once reply cache keyed by (client, seqno)
//!
//! Besides the replies themselves each client has a pruned mark: every
//! seqno below it was executed and acknowledged, so a late duplicate of
//! one of them is refused instead of running again.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use sigmap::{ClientId, Seqno};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplyKey {
    pub client: ClientId,
    pub seqno: Seqno,
}

impl ReplyKey {
    pub fn new(client: ClientId, seqno: Seqno) -> Self {
        Self { client, seqno }
    }
}

impl std::fmt::Display for ReplyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.client, self.seqno)
    }
}

enum Entry<R> {
    InFlight(watch::Sender<Option<R>>),
    Done(R),
}

struct ClientEntries<R> {
    /// Seqnos below this were acknowledged and dropped
    pruned: Seqno,
    entries: BTreeMap<Seqno, Entry<R>>,
}

impl<R> Default for ClientEntries<R> {
    fn default() -> Self {
        Self {
            pruned: Seqno::default(),
            entries: BTreeMap::new(),
        }
    }
}

/// Completed replies of one client, as carried in a server snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReplies<R> {
    pub client: ClientId,
    pub pruned: Seqno,
    pub done: Vec<(Seqno, R)>,
}

/// Resolves when the execution of a key completes
pub struct ReplyFuture<R> {
    state: Waiting<R>,
}

enum Waiting<R> {
    Ready(R),
    Pending(watch::Receiver<Option<R>>),
}

impl<R: Clone> ReplyFuture<R> {
    /// The reply, or `None` if the entry was dropped without completing
    pub async fn wait(self) -> Option<R> {
        match self.state {
            Waiting::Ready(r) => Some(r),
            Waiting::Pending(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(r) => r.clone(),
                Err(_) => None,
            },
        }
    }
}

/// Outcome of registering a key
pub enum Registration<R> {
    /// First sighting: the caller must execute and call `put_reply`
    New,
    InFlight(ReplyFuture<R>),
    Done(R),
    /// Executed and acknowledged long ago; its reply is gone
    Pruned,
}

pub struct ReplyTable<R> {
    clients: Mutex<HashMap<ClientId, ClientEntries<R>>>,
}

impl<R: Clone> Default for ReplyTable<R> {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Clone> ReplyTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: ReplyKey) -> Registration<R> {
        let mut clients = self.clients.lock();
        let client = clients.entry(key.client).or_default();
        match client.entries.get(&key.seqno) {
            Some(Entry::Done(r)) => Registration::Done(r.clone()),
            Some(Entry::InFlight(tx)) => Registration::InFlight(ReplyFuture {
                state: Waiting::Pending(tx.subscribe()),
            }),
            None if key.seqno < client.pruned => Registration::Pruned,
            None => {
                let (tx, _) = watch::channel(None);
                client.entries.insert(key.seqno, Entry::InFlight(tx));
                Registration::New
            }
        }
    }

    /// Complete `key`, waking anyone waiting on it
    ///
    /// # Panics
    ///
    /// If `key` already completed: that would mean an op ran twice.
    pub fn put_reply(&self, key: ReplyKey, reply: R) {
        let mut clients = self.clients.lock();
        let client = clients.entry(key.client).or_default();
        match client.entries.insert(key.seqno, Entry::Done(reply.clone())) {
            Some(Entry::InFlight(tx)) => {
                tx.send_replace(Some(reply));
            }
            Some(Entry::Done(_)) => panic!("reply for {key} completed twice"),
            None => {}
        }
    }

    /// Follow an execution that is running or done, without registering
    pub fn watch(&self, key: ReplyKey) -> Option<ReplyFuture<R>> {
        let clients = self.clients.lock();
        let state = match clients.get(&key.client)?.entries.get(&key.seqno)? {
            Entry::Done(r) => Waiting::Ready(r.clone()),
            Entry::InFlight(tx) => Waiting::Pending(tx.subscribe()),
        };
        Some(ReplyFuture { state })
    }

    pub fn lookup(&self, key: ReplyKey) -> Option<R> {
        match self.clients.lock().get(&key.client)?.entries.get(&key.seqno)? {
            Entry::Done(r) => Some(r.clone()),
            Entry::InFlight(_) => None,
        }
    }

    /// Whether `key` fell below its client's pruned mark without an entry
    pub fn is_pruned(&self, key: ReplyKey) -> bool {
        self.clients.lock().get(&key.client).is_some_and(|c| {
            key.seqno < c.pruned && !c.entries.contains_key(&key.seqno)
        })
    }

    /// Drop completed replies of `client` below `below`
    ///
    /// The client has acknowledged them, so no retry can ask again. The
    /// mark only moves up.
    pub fn prune(&self, client: ClientId, below: Seqno) -> usize {
        let mut clients = self.clients.lock();
        let c = clients.entry(client).or_default();
        if below > c.pruned {
            c.pruned = below;
        }
        let keep = c.entries.split_off(&below);
        let (done, in_flight): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::replace(&mut c.entries, keep)
                .into_iter()
                .partition(|(_, e)| matches!(e, Entry::Done(_)));
        c.entries.extend(in_flight);
        done.len()
    }

    pub fn forget_client(&self, client: ClientId) {
        if let Some(c) = self.clients.lock().remove(&client) {
            tracing::debug!(%client, entries = c.entries.len(), "forgot client replies");
        }
    }

    /// Completed replies and pruned marks; executions still running are left out
    pub fn snapshot(&self) -> Vec<ClientReplies<R>> {
        let clients = self.clients.lock();
        let mut out: Vec<ClientReplies<R>> = clients
            .iter()
            .map(|(client, c)| ClientReplies {
                client: *client,
                pruned: c.pruned,
                done: c
                    .entries
                    .iter()
                    .filter_map(|(s, e)| match e {
                        Entry::Done(r) => Some((*s, r.clone())),
                        Entry::InFlight(_) => None,
                    })
                    .collect(),
            })
            .collect();
        out.sort_by_key(|c| c.client);
        out
    }

    /// Replace the table with `snapshot`
    pub fn restore(&self, snapshot: Vec<ClientReplies<R>>) {
        let mut clients = self.clients.lock();
        clients.clear();
        for c in snapshot {
            let entries = c
                .done
                .into_iter()
                .map(|(s, r)| (s, Entry::Done(r)))
                .collect();
            clients.insert(
                c.client,
                ClientEntries {
                    pruned: c.pruned,
                    entries,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().values().map(|c| c.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
