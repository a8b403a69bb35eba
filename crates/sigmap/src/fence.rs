//! Fences: capabilities proving a holder's view of a path is current

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::Epoch;
use crate::path;

/// Names the path a fence protects
///
/// The path is normalized on construction and again when decoded, so two
/// spellings of one path compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "WireFenceId")]
pub struct FenceId {
    pub path: String,
}

#[derive(Deserialize)]
struct WireFenceId {
    path: String,
}

impl From<WireFenceId> for FenceId {
    fn from(w: WireFenceId) -> Self {
        FenceId::new(&w.path)
    }
}

impl FenceId {
    pub fn new(p: &str) -> Self {
        Self {
            path: path::normalize(p),
        }
    }
}

/// A fence applies to its path and everything below it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fence {
    pub id: FenceId,
    pub epoch: Epoch,
}

impl Fence {
    pub fn new(p: &str, epoch: u64) -> Self {
        Self {
            id: FenceId::new(p),
            epoch: Epoch(epoch),
        }
    }

    pub fn covers(&self, target: &str) -> bool {
        path::is_ancestor(&self.id.path, target)
    }
}

impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.path, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_covers_subtree() {
        let f = Fence::new("cfg/", 3);
        assert_eq!(f.id.path, "/cfg");
        assert!(f.covers("/cfg"));
        assert!(f.covers("/cfg/leader"));
        assert!(!f.covers("/cfgx"));
        assert_eq!(f.to_string(), "/cfg@3");
    }

    #[test]
    fn test_decoded_fence_path_is_normalized() {
        let raw = Fence {
            id: FenceId {
                path: "cfg//leader/".into(),
            },
            epoch: Epoch(1),
        };
        let bytes = bincode::serialize(&raw).unwrap();
        let f: Fence = bincode::deserialize(&bytes).unwrap();
        assert_eq!(f.id, FenceId::new("/cfg/leader"));
        assert!(f.covers("/cfg/leader/x"));
    }
}
