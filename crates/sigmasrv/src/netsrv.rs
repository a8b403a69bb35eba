//! TCP front end of an [`FsServer`]

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use sigmap::{framed, CallReader, CallWriter, Fcall, SigmaError};

use crate::fssrv::FsServer;

pub struct NetServer {
    listener: TcpListener,
    fs: Arc<FsServer>,
}

impl NetServer {
    pub async fn bind(addr: SocketAddr, fs: Arc<FsServer>) -> Result<Self, SigmaError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SigmaError::Unreachable(format!("bind {addr}: {e}")))?;
        Ok(Self { listener, fs })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SigmaError> {
        self.listener.local_addr().map_err(SigmaError::wrap)
    }

    /// Accept connections until the listener fails
    pub async fn serve(self) -> Result<(), SigmaError> {
        info!(addr = ?self.listener.local_addr().ok(), "serving sigmaP");
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| SigmaError::Unreachable(e.to_string()))?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay: {}", e);
            }
            debug!(%peer, "accepted connection");
            let fs = self.fs.clone();
            tokio::spawn(async move {
                let (reader, writer) = framed(stream);
                serve_conn(fs, reader, writer).await;
                debug!(%peer, "connection done");
            });
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> Result<(), SigmaError> {
        tokio::select! {
            r = self.serve() => r,
            _ = shutdown => Ok(()),
        }
    }
}

/// Feed the fcalls of one connection to `fs` and write back the replies
///
/// Returns when the transport fails, after closing every session that was
/// seen on it.
pub async fn serve_conn<R, W>(fs: Arc<FsServer>, mut reader: R, mut writer: W)
where
    R: CallReader<Fcall>,
    W: CallWriter<Fcall> + 'static,
{
    let (tx, rx) = flume::unbounded::<Fcall>();
    let writer_task = tokio::spawn(async move {
        while let Ok(fc) = rx.recv_async().await {
            if let Err(e) = writer.write_call(&fc).await {
                debug!(tag = %fc.tag, "write reply: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut sessions = HashSet::new();
    loop {
        match reader.read_call().await {
            Ok(fc) => {
                sessions.insert(fc.session);
                fs.process(fc, &tx);
            }
            Err(e) => {
                debug!("read: {}", e);
                break;
            }
        }
    }

    for sid in sessions {
        match fs.close_session(sid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%sid, "close after disconnect: {}", e),
        }
    }
    writer_task.abort();
}
