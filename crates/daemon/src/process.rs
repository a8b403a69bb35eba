//! Starting and stopping the service

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use sigmap::SigmaError;
use sigmasrv::NetServer;

use crate::service_config::Config;
use crate::service_state::{State, StateSetupError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("setup failed: {0}")]
    Setup(#[from] StateSetupError),
    #[error("network error: {0}")]
    Net(#[from] SigmaError),
    #[error("signal handler: {0}")]
    Signal(std::io::Error),
    #[error("service task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Stops a service started with [`spawn_service`]
pub struct ShutdownHandle {
    addr: SocketAddr,
    state: Arc<State>,
    tx: oneshot::Sender<()>,
    task: JoinHandle<Result<(), SigmaError>>,
}

impl ShutdownHandle {
    /// Where the service accepts connections
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Stop accepting connections and close every session
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        let _ = self.tx.send(());
        self.task.await??;
        self.state.fs().shutdown().await;
        Ok(())
    }
}

/// Bind and serve in the background
pub async fn spawn_service(config: &Config) -> Result<ShutdownHandle, ServiceError> {
    let state = Arc::new(State::from_config(config).await?);
    let srv = NetServer::bind(config.listen_addr, state.fs().clone()).await?;
    let addr = srv.local_addr()?;
    tracing::info!(%addr, replicated = config.replicated, "sigmad listening");

    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(srv.serve_until(async move {
        let _ = rx.await;
    }));
    Ok(ShutdownHandle {
        addr,
        state,
        tx,
        task,
    })
}

/// Serve until interrupted
pub async fn start_service(config: &Config) -> Result<(), ServiceError> {
    let handle = spawn_service(config).await?;
    tokio::signal::ctrl_c().await.map_err(ServiceError::Signal)?;
    tracing::info!("interrupted, shutting down");
    handle.shutdown().await
}
