use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;

use sigma_daemon::state::{AppState, StateError};
use sigma_daemon::{start_service, ConfigError, ServiceConfig, ServiceError};

/// Run the sigmaP server until interrupted
#[derive(Args, Debug, Clone)]
pub struct Serve {
    /// Read the config from this file instead of the state directory
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Run replicated even if the config says otherwise
    #[arg(long)]
    pub replicated: bool,

    /// Start with the default config when none was initialized
    #[arg(long)]
    pub ephemeral: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

impl Serve {
    /// The config the service starts with, flags applied
    pub fn config(&self, config_path: Option<PathBuf>) -> Result<ServiceConfig, ServeError> {
        let base = match &self.config_file {
            Some(file) => ServiceConfig::load(file)?,
            None => self.state_config(AppState::load(config_path))?,
        };
        Ok(self.apply_flags(base))
    }

    fn state_config(&self, state: Result<AppState, StateError>) -> Result<ServiceConfig, StateError> {
        match state {
            Ok(state) => Ok(ServiceConfig::from(&state.config)),
            Err(StateError::NotInitialized(_)) if self.ephemeral => Ok(ServiceConfig::default()),
            Err(e) => Err(e),
        }
    }

    fn apply_flags(&self, mut config: ServiceConfig) -> ServiceConfig {
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        config.replicated |= self.replicated;
        config
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Serve {
    type Error = ServeError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = self.config(ctx.config_path.clone())?;
        start_service(&config).await?;
        Ok("sigmad stopped".to_string())
    }
}
