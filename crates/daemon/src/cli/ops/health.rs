use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;

use sigma_daemon::state::AppState;
use sigmaclnt::SessClnt;

#[derive(Args, Debug, Clone)]
pub struct Health;

#[derive(Debug)]
pub struct ConfigInfo {
    pub directory: PathBuf,
    pub listen_addr: SocketAddr,
    pub replicated: bool,
}

#[derive(Debug)]
pub enum ServerStatus {
    Ok { msize: u32 },
    NotReachable(String),
}

#[derive(Debug)]
pub struct HealthOutput {
    pub config: Option<ConfigInfo>,
    pub config_error: Option<String>,
    pub addr: SocketAddr,
    pub server: ServerStatus,
}

impl fmt::Display for HealthOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", "Config".bold())?;
        match &self.config {
            Some(info) => {
                writeln!(
                    f,
                    "  {} {}",
                    "directory:".dimmed(),
                    info.directory.display()
                )?;
                writeln!(f, "  {} {}", "config.toml:".dimmed(), "OK".green())?;
                writeln!(f, "  {} {}", "listen_addr:".dimmed(), info.listen_addr)?;
                writeln!(f, "  {} {}", "replicated:".dimmed(), info.replicated)?;
            }
            None => {
                if let Some(err) = &self.config_error {
                    writeln!(f, "  {} {}", "error:".red(), err)?;
                }
            }
        }

        writeln!(f)?;
        writeln!(f, "{} ({}):", "Server".bold(), self.addr)?;
        match &self.server {
            ServerStatus::Ok { msize } => {
                writeln!(f, "  {} {}", "sigmaP:".dimmed(), "OK".green())?;
                write!(f, "  {} {}", "msize:".dimmed(), msize)
            }
            ServerStatus::NotReachable(e) => {
                write!(f, "  {} {} ({})", "sigmaP:".dimmed(), "NOT REACHABLE".red(), e)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Health check failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Health {
    type Error = HealthError;
    type Output = HealthOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (config, config_error) = match AppState::load(ctx.config_path.clone()) {
            Ok(state) => (
                Some(ConfigInfo {
                    directory: state.sigma_dir,
                    listen_addr: state.config.listen_addr,
                    replicated: state.config.replicated,
                }),
                None,
            ),
            Err(e) => (None, Some(e.to_string())),
        };

        let addr = ctx.server_addr();
        let server = match SessClnt::connect(addr).await {
            Ok(sess) => {
                let status = match sess.version().await {
                    Ok(msize) => ServerStatus::Ok { msize },
                    Err(e) => ServerStatus::NotReachable(e.to_string()),
                };
                sess.close().await;
                status
            }
            Err(e) => ServerStatus::NotReachable(e.to_string()),
        };

        Ok(HealthOutput {
            config,
            config_error,
            addr,
            server,
        })
    }
}
