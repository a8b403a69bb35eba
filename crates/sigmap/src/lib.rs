//! sigmaP protocol types shared by clients and servers
//!
//! This crate holds everything both ends of a sigmaP connection agree on:
//! identifiers, the fcall message set, the error taxonomy, fences and the
//! frame codec that moves fcalls over a byte stream.

pub mod codec;
pub mod error;
pub mod fcall;
pub mod fence;
pub mod ids;
pub mod path;
pub mod perm;

pub use codec::{framed, CallReader, CallWriter, FramedReader, FramedWriter};
pub use error::SigmaError;
pub use fcall::{DirEntry, Fcall, Msg};
pub use fence::{Fence, FenceId};
pub use ids::{ClientId, Epoch, Fid, LeaseId, Qpath, SeqCounter, Seqno, SessionId, Tag};
pub use perm::{Mode, Perm, QType, Qid, Stat};

/// Protocol version string negotiated by `Tversion`
pub const VERSION: &str = "sigmaP";

/// Largest frame either side will accept
pub const MAX_FRAME: usize = 8 * 1024 * 1024;
