use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use sigmap::SigmaError;

#[derive(Args, Debug, Clone)]
pub struct Stat {
    pub path: String,
}

#[derive(Debug)]
pub struct StatOutput {
    pub path: String,
    pub stat: sigmap::Stat,
}

impl fmt::Display for StatOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stat = &self.stat;
        let kind = if stat.qid.is_dir() { "dir" } else { "file" };
        writeln!(f, "{} {}", "Path:".dimmed(), self.path.bold())?;
        writeln!(f, "  {} {}", "type:".dimmed(), kind)?;
        writeln!(f, "  {} {:o}", "perm:".dimmed(), stat.perm.0)?;
        writeln!(f, "  {} {}", "ephemeral:".dimmed(), stat.perm.is_ephemeral())?;
        writeln!(f, "  {} {}", "length:".dimmed(), stat.length)?;
        writeln!(f, "  {} {}", "version:".dimmed(), stat.qid.version)?;
        write!(f, "  {} {}", "qpath:".dimmed(), stat.qid.path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatError {
    #[error("sigmaP error: {0}")]
    Sigma(#[from] SigmaError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Stat {
    type Error = StatError;
    type Output = StatOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        let stat = client.stat(&self.path).await?;
        Ok(StatOutput {
            path: self.path.clone(),
            stat,
        })
    }
}
