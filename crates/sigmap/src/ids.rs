//! Identifier newtypes and the monotonic counter that hands them out

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// Per-connection request tag pairing a reply with its request
    Tag(u64)
);
id_type!(
    /// Per-client request number used for duplicate detection
    Seqno(u64)
);
id_type!(
    /// Opaque session identifier chosen by the client
    SessionId(u64)
);
id_type!(
    /// Identifies a client across sessions and replicas
    ClientId(u64)
);
id_type!(
    /// Per-session file handle
    Fid(u32)
);
id_type!(
    /// Server-unique object number
    Qpath(u64)
);
id_type!(
    /// Fence epoch; later epochs invalidate earlier ones
    Epoch(u64)
);
id_type!(LeaseId(u64));

impl Tag {
    pub const NONE: Tag = Tag(u64::MAX);
}

impl Fid {
    pub const NONE: Fid = Fid(u32::MAX);
}

impl Epoch {
    /// No fence recorded yet
    pub const NONE: Epoch = Epoch(0);
}

/// Monotonic counter for tags, seqnos and similar ids
///
/// `next` returns the incremented value, so a counter created with `new(0)`
/// hands out 1, 2, 3 and leaves 0 free to mean "none".
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicU64);

impl SeqCounter {
    pub const fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last value handed out
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_counter_starts_after_seed() {
        let c = SeqCounter::new(0);
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.current(), 2);
    }

    #[test]
    fn test_counter_unique_across_threads() {
        let c = Arc::new(SeqCounter::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                std::thread::spawn(move || (0..1000).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "duplicate value {v}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_display_is_inner_value() {
        assert_eq!(SessionId(42).to_string(), "42");
        assert_eq!(Tag::from(7).to_string(), "7");
    }
}
