use std::fmt;

use clap::Args;
use comfy_table::Table;
use owo_colors::OwoColorize;

use sigmap::SigmaError;
use sigmasrv::{StatsSnapshot, STATS_FILE};

/// Operation counters of the server
#[derive(Args, Debug, Clone)]
pub struct Stats;

#[derive(Debug)]
pub struct StatsOutput {
    pub stats: StatsSnapshot,
}

impl fmt::Display for StatsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "{}", "Server".bold())?;
        writeln!(f, "  {} {}", "sessions:".dimmed(), s.sessions)?;
        writeln!(f, "  {} {}", "fcalls:".dimmed(), s.nops)?;
        writeln!(f, "  {} {}", "errors:".dimmed(), s.nerrors)?;
        writeln!(f, "  {} {}", "replicated:".dimmed(), s.replicated)?;
        writeln!(f, "  {} {}", "duplicates:".dimmed(), s.duplicates)?;

        let mut table = Table::new();
        table.set_header(vec!["FCALL", "COUNT"]);
        for (name, n) in &s.ops {
            table.add_row(vec![name.clone(), n.to_string()]);
        }
        write!(f, "{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("sigmaP error: {0}")]
    Sigma(#[from] SigmaError),
    #[error("bad stats payload: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Stats {
    type Error = StatsError;
    type Output = StatsOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        let data = client.get_file(STATS_FILE).await?;
        let stats = serde_json::from_slice(&data)?;
        Ok(StatsOutput { stats })
    }
}
