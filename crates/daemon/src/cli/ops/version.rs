use std::convert::Infallible;
use std::fmt;

use clap::Args;

use crate::cli::op::{Op, OpContext};

/// Print the daemon build and the sigmaP protocol it speaks
#[derive(Args, Debug, Clone)]
pub struct Version {
    /// Print only the protocol version
    #[arg(long)]
    pub protocol: bool,
}

#[derive(Debug)]
pub struct VersionOutput {
    pub build: Option<String>,
    pub protocol: &'static str,
}

impl fmt::Display for VersionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.build {
            Some(build) => write!(f, "{build}"),
            None => write!(f, "{}", self.protocol),
        }
    }
}

#[async_trait::async_trait]
impl Op for Version {
    type Error = Infallible;
    type Output = VersionOutput;

    async fn execute(&self, _ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        Ok(VersionOutput {
            build: (!self.protocol).then(sigma_daemon::build_info),
            protocol: sigmap::VERSION,
        })
    }
}
