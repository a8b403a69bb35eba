use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use owo_colors::OwoColorize;

use sigma_daemon::state::{AppConfig, AppState, StateError, DEFAULT_LISTEN_ADDR};
use sigmasrv::FsServerConfig;

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Address the server listens on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: SocketAddr,

    /// Run fcalls through the replication log
    #[arg(long)]
    pub replicated: bool,

    /// Close sessions silent for this many milliseconds (0 disables)
    #[arg(long, default_value = "30000")]
    pub session_timeout_ms: u64,
}

#[derive(Debug)]
pub struct InitOutput {
    pub sigma_dir: PathBuf,
    pub config_path: PathBuf,
    pub listen_addr: SocketAddr,
    pub replicated: bool,
    pub session_timeout: Option<Duration>,
}

impl fmt::Display for InitOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} sigmad at {}",
            "Initialized".green().bold(),
            self.sigma_dir.display().to_string().bold()
        )?;
        writeln!(f, "  {} {}", "Config:".dimmed(), self.config_path.display())?;
        writeln!(f, "  {} {}", "Listen:".dimmed(), self.listen_addr)?;
        writeln!(f, "  {} {}", "Replicated:".dimmed(), self.replicated)?;
        let timeout = match self.session_timeout {
            Some(t) => format!("{}ms", t.as_millis()),
            None => "never".to_string(),
        };
        write!(f, "  {} {}", "Session timeout:".dimmed(), timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = InitOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session_timeout =
            (self.session_timeout_ms > 0).then(|| Duration::from_millis(self.session_timeout_ms));
        let config = AppConfig {
            listen_addr: self.listen_addr,
            replicated: self.replicated,
            server: FsServerConfig {
                session_timeout,
                ..Default::default()
            },
            ..Default::default()
        };

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;

        Ok(InitOutput {
            sigma_dir: state.sigma_dir,
            config_path: state.config_path,
            listen_addr: state.config.listen_addr,
            replicated: state.config.replicated,
            session_timeout: state.config.server.session_timeout,
        })
    }
}
