//! Per-server operation counters

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sigmap::{Msg, SigmaError};

#[derive(Debug, Default)]
pub struct Stats {
    nops: AtomicU64,
    nerrors: AtomicU64,
    replicated: AtomicU64,
    duplicates: AtomicU64,
    ops: Mutex<BTreeMap<&'static str, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub nops: u64,
    pub nerrors: u64,
    /// Fcalls that went through the replication log
    pub replicated: u64,
    /// Fcalls answered from the reply cache
    pub duplicates: u64,
    pub sessions: usize,
    pub ops: BTreeMap<String, u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&self, msg: &Msg) {
        self.nops.fetch_add(1, Ordering::Relaxed);
        *self.ops.lock().entry(msg.name()).or_default() += 1;
    }

    pub fn error(&self) {
        self.nerrors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replicated(&self) {
        self.replicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, sessions: usize) -> StatsSnapshot {
        StatsSnapshot {
            nops: self.nops.load(Ordering::Relaxed),
            nerrors: self.nerrors.load(Ordering::Relaxed),
            replicated: self.replicated.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            sessions,
            ops: self
                .ops
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

impl StatsSnapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, SigmaError> {
        serde_json::to_vec_pretty(self).map_err(SigmaError::wrap)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops={} errors={} replicated={} duplicates={} sessions={}",
            self.nops, self.nerrors, self.replicated, self.duplicates, self.sessions
        )?;
        for (name, n) in &self.ops {
            write!(f, " {name}={n}")?;
        }
        Ok(())
    }
}
