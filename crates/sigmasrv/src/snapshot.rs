//! Whole-server snapshots
//!
//! A snapshot holds the storage tree, the open sessions with their fids,
//! ephemeral files and registered fences, the newest epoch of every fenced
//! path, and the completed replies of the reply cache along with each
//! client's pruned mark. Watches, session conditions and ops still running
//! are not part of it; a server restored from a snapshot starts with none.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use sigmap::{Fence, Msg, SigmaError};

use crate::fssrv::Core;
use crate::repl::{ClientReplies, Snapshotter};
use crate::session::SessionImage;

#[derive(Debug, Serialize, Deserialize)]
struct FsImage {
    store: Vec<u8>,
    sessions: Vec<SessionImage>,
    fences: Vec<Fence>,
    replies: Vec<ClientReplies<Msg>>,
}

#[async_trait]
impl Snapshotter for Core {
    async fn snapshot(&self) -> Result<Vec<u8>, SigmaError> {
        let image = FsImage {
            store: self.store.snapshot().await?,
            sessions: self.st.images(),
            fences: self.rft.snapshot().await,
            replies: self.replies.snapshot(),
        };
        let bytes = bincode::serialize(&image)?;
        info!(
            sessions = image.sessions.len(),
            clients = image.replies.len(),
            bytes = bytes.len(),
            "snapshot taken"
        );
        Ok(bytes)
    }

    async fn restore(&self, snapshot: &[u8]) -> Result<(), SigmaError> {
        if !self.st.is_empty() {
            return Err(SigmaError::Inval(format!(
                "restore over {} open sessions",
                self.st.len()
            )));
        }
        let image: FsImage = bincode::deserialize(snapshot)?;
        let sessions = image.sessions.len();
        self.store.restore(&image.store).await?;
        self.rft.restore(image.fences);
        self.replies.restore(image.replies);
        self.st.restore(image.sessions)?;
        info!(sessions, "snapshot restored");
        Ok(())
    }
}
