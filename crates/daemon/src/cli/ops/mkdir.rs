use clap::Args;

use sigmap::{Mode, Perm, SigmaError};

#[derive(Args, Debug, Clone)]
pub struct Mkdir {
    /// Directory to create
    pub path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MkdirError {
    #[error("sigmaP error: {0}")]
    Sigma(#[from] SigmaError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Mkdir {
    type Error = MkdirError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        let fd = client
            .create(&self.path, Perm::DMDIR | Perm(0o755), Mode::OREAD)
            .await?;
        client.close(fd).await?;
        Ok(format!("created {}", self.path))
    }
}
