//! Request/reply demultiplexing over a single ordered transport
//!
//! Many tasks share one connection: each call registers its tag in a
//! [`CallMap`], one reader task matches replies back to waiters by tag, and
//! a transport failure fails every outstanding call as unreachable.

pub mod callmap;
pub mod clnt;

pub use callmap::CallMap;
pub use clnt::DemuxClnt;

use sigmap::{Fcall, Tag};

/// A message with a tag the demux layer can route on
pub trait Call: Send + Sync + 'static {
    fn tag(&self) -> Tag;
}

impl Call for Fcall {
    fn tag(&self) -> Tag {
        self.tag
    }
}
