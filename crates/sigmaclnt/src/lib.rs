//! sigmaP client
//!
//! [`SessClnt`] is one session multiplexed over one connection. [`FdClient`]
//! layers paths, file descriptors, watches and fences on top of it.

pub mod fdclient;
pub mod sessclnt;

pub use fdclient::{Fd, FdClient, CHUNK};
pub use sessclnt::SessClnt;
