//! Everything a running service owns

use std::sync::Arc;

use sigmap::SigmaError;
use sigmasrv::{FsServer, LocalLog, MemStore};

use crate::service_config::Config;

pub struct State {
    fs: Arc<FsServer>,
    log: Option<Arc<LocalLog>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("server setup failed: {0}")]
    Server(#[from] SigmaError),
}

impl State {
    pub async fn from_config(config: &Config) -> Result<Self, StateSetupError> {
        let mut builder = FsServer::builder()
            .store(Arc::new(MemStore::new()))
            .config(config.server.clone());

        let log = if config.replicated {
            let log = LocalLog::new();
            builder = builder.replicator(log.clone());
            Some(log)
        } else {
            None
        };

        let fs = Arc::new(builder.build().await?);
        tracing::info!(
            replicated = fs.is_replicated(),
            session_timeout = ?config.server.session_timeout,
            "server state ready"
        );
        Ok(Self { fs, log })
    }

    pub fn fs(&self) -> &Arc<FsServer> {
        &self.fs
    }

    /// Entries in the replication log, if the service is replicated
    pub fn log_len(&self) -> Option<usize> {
        self.log.as_ref().map(|log| log.len())
    }
}
