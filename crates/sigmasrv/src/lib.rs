//! sigmaP server core
//!
//! Sessions and their per-session threads, session condition variables,
//! fences and leases, the reply cache and replication substrate, storage
//! backends, the protocol dispatch of every fcall and the TCP front end.

pub mod config;
pub mod fences;
pub mod fid;
pub mod fssrv;
pub mod netsrv;
pub mod protsrv;
pub mod repl;
pub mod sesscond;
pub mod session;
mod snapshot;
pub mod stats;
pub mod store;
pub mod threadmgr;
pub mod watch;

pub use config::FsServerConfig;
pub use fssrv::{FsServer, FsServerBuilder, FsSession};
pub use netsrv::{serve_conn, NetServer};
pub use protsrv::STATS_FILE;
pub use repl::{LocalLog, Replicator, Snapshotter};
pub use stats::StatsSnapshot;
pub use store::{MemStore, Storage};
