use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use sigmap::SigmaError;

#[derive(Args, Debug, Clone)]
pub struct Cat {
    /// File to read
    pub path: String,
}

#[derive(Debug)]
pub enum CatContent {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug)]
pub struct CatOutput {
    pub path: String,
    pub size: usize,
    pub content: CatContent,
}

impl fmt::Display for CatOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}  {} {} bytes",
            "File:".dimmed(),
            self.path.bold(),
            "Size:".dimmed(),
            self.size
        )?;
        match &self.content {
            CatContent::Text(text) => write!(f, "{text}"),
            CatContent::Binary(bytes) => {
                let hex = bytes
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(" ");
                write!(f, "{} {hex}", "Binary content (hex):".dimmed())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatError {
    #[error("sigmaP error: {0}")]
    Sigma(#[from] SigmaError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Cat {
    type Error = CatError;
    type Output = CatOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        let bytes = client.get_file(&self.path).await?;
        let size = bytes.len();
        let content = match String::from_utf8(bytes) {
            Ok(text) => CatContent::Text(text),
            Err(e) => CatContent::Binary(e.into_bytes()),
        };
        Ok(CatOutput {
            path: self.path.clone(),
            size,
            content,
        })
    }
}
