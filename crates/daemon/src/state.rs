//! On-disk state of the daemon: its directory and `config.toml`

use std::net::SocketAddr;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use sigmasrv::FsServerConfig;

pub const APP_NAME: &str = "sigmad";
pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1110";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the sigmaP server listens on and clients dial
    pub listen_addr: SocketAddr,
    /// Route fcalls through the replication log
    pub replicated: bool,
    /// Default log filter of the service; `RUST_LOG` wins
    pub log_level: String,
    pub server: FsServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            replicated: false,
            log_level: "info".to_string(),
            server: FsServerConfig::default(),
        }
    }
}

pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1110))
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub sigma_dir: PathBuf,
    pub config_path: PathBuf,
    pub config: AppConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("no home directory to keep state in")]
    NoHomeDir,
    #[error("not initialized: {0} is missing, run `sigmad init`")]
    NotInitialized(PathBuf),
    #[error("already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config encode: {0}")]
    Encode(#[from] toml::ser::Error),
}

impl AppState {
    /// The state directory, `custom` if given
    pub fn sigma_dir(custom: Option<PathBuf>) -> Result<PathBuf, StateError> {
        match custom {
            Some(dir) => Ok(dir),
            None => ProjectDirs::from("", "", APP_NAME)
                .map(|dirs| dirs.config_dir().to_path_buf())
                .ok_or(StateError::NoHomeDir),
        }
    }

    /// Create the state directory and write `config` (or the defaults)
    pub fn init(custom: Option<PathBuf>, config: Option<AppConfig>) -> Result<Self, StateError> {
        let sigma_dir = Self::sigma_dir(custom)?;
        let config_path = sigma_dir.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(StateError::AlreadyInitialized(sigma_dir));
        }

        std::fs::create_dir_all(&sigma_dir)?;
        let config = config.unwrap_or_default();
        std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;
        tracing::info!(path = %config_path.display(), "wrote config");

        Ok(Self {
            sigma_dir,
            config_path,
            config,
        })
    }

    pub fn load(custom: Option<PathBuf>) -> Result<Self, StateError> {
        let sigma_dir = Self::sigma_dir(custom)?;
        let config_path = sigma_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(StateError::NotInitialized(config_path));
        }
        let config: AppConfig = toml::from_str(&std::fs::read_to_string(&config_path)?)?;
        Ok(Self {
            sigma_dir,
            config_path,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_init_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        let config = AppConfig {
            listen_addr: "127.0.0.1:7000".parse().unwrap(),
            replicated: true,
            server: FsServerConfig {
                monitor_interval: Duration::from_millis(250),
                ..Default::default()
            },
            ..Default::default()
        };

        let state = AppState::init(Some(dir.clone()), Some(config.clone())).unwrap();
        assert_eq!(state.config_path, dir.join(CONFIG_FILE));
        assert!(matches!(
            AppState::init(Some(dir.clone()), None),
            Err(StateError::AlreadyInitialized(_))
        ));

        let loaded = AppState::load(Some(dir)).unwrap();
        assert_eq!(loaded.config, config);
    }

    #[test]
    fn test_load_uninitialized() {
        let tmp = tempfile::tempdir().unwrap();
        let r = AppState::load(Some(tmp.path().to_path_buf()));
        assert!(matches!(r, Err(StateError::NotInitialized(_))));
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            replicated = true

            [server]
            session_timeout = 5000
            "#,
        )
        .unwrap();
        assert!(config.replicated);
        assert_eq!(config.listen_addr, default_listen_addr());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.server.session_timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            config.server.monitor_interval,
            FsServerConfig::default().monitor_interval
        );
    }
}
