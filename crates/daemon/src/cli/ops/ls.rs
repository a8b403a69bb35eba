use std::fmt;

use clap::Args;
use comfy_table::Table;

use sigmap::{DirEntry, SigmaError};

#[derive(Args, Debug, Clone)]
pub struct Ls {
    /// Directory to list (defaults to root)
    #[arg(default_value = "/")]
    pub path: String,
}

#[derive(Debug)]
pub struct LsOutput {
    pub items: Vec<DirEntry>,
}

impl fmt::Display for LsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.items.is_empty() {
            return write!(f, "No items found");
        }

        let mut table = Table::new();
        table.set_header(vec!["TYPE", "NAME", "VERSION", "QPATH"]);
        for item in &self.items {
            let type_str = if item.qid.is_dir() { "dir" } else { "file" };
            table.add_row(vec![
                type_str.to_string(),
                item.name.clone(),
                item.qid.version.to_string(),
                item.qid.path.to_string(),
            ]);
        }
        write!(f, "{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LsError {
    #[error("sigmaP error: {0}")]
    Sigma(#[from] SigmaError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Ls {
    type Error = LsError;
    type Output = LsOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        let items = client.read_dir(&self.path).await?;
        Ok(LsOutput { items })
    }
}
