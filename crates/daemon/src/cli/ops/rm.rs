use clap::Args;

use sigmap::SigmaError;

#[derive(Args, Debug, Clone)]
pub struct Rm {
    /// File or empty directory to remove
    pub path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RmError {
    #[error("sigmaP error: {0}")]
    Sigma(#[from] SigmaError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Rm {
    type Error = RmError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        client.remove(&self.path).await?;
        Ok(format!("removed {}", self.path))
    }
}
