//! Runtime configuration of the service, resolved from [`AppConfig`] and
//! command line overrides

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use sigmasrv::FsServerConfig;

use crate::state::AppConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub replicated: bool,
    pub log_level: String,
    pub server: FsServerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("invalid config {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

impl Config {
    /// Load a standalone config file in the `config.toml` format
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let app: AppConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        Ok(Self::from(&app))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for Config {
    fn from(app: &AppConfig) -> Self {
        Self {
            listen_addr: app.listen_addr,
            replicated: app.replicated,
            log_level: app.log_level.clone(),
            server: app.server.clone(),
        }
    }
}
