use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;

use sigmap::{Mode, Perm, SigmaError};

/// Write a file, creating it if needed
#[derive(Args, Debug, Clone)]
pub struct Put {
    /// File to write
    pub path: String,

    /// Contents to write
    #[arg(conflicts_with = "file")]
    pub data: Option<String>,

    /// Read the contents from a local file instead
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Append instead of replacing the contents
    #[arg(long)]
    pub append: bool,
}

#[derive(Debug)]
pub struct PutOutput {
    pub path: String,
    pub written: u32,
}

impl fmt::Display for PutOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} bytes to {}",
            "Wrote".green().bold(),
            self.written,
            self.path.bold()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PutError {
    #[error("sigmaP error: {0}")]
    Sigma(#[from] SigmaError),
    #[error("reading {0}: {1}")]
    Read(PathBuf, std::io::Error),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Put {
    type Error = PutError;
    type Output = PutOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let data = match &self.file {
            Some(path) => tokio::fs::read(path)
                .await
                .map_err(|e| PutError::Read(path.clone(), e))?,
            None => self.data.clone().unwrap_or_default().into_bytes(),
        };
        let mode = if self.append {
            Mode::OWRITE | Mode::OAPPEND
        } else {
            Mode::OWRITE | Mode::OTRUNC
        };

        let client = ctx.client().await?;
        let written = client
            .put_file(&self.path, Perm(0o644), mode, &data, None)
            .await?;
        Ok(PutOutput {
            path: self.path.clone(),
            written,
        })
    }
}
