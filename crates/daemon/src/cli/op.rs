use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use sigma_daemon::state::{default_listen_addr, AppState};
use sigmaclnt::{FdClient, SessClnt};
use sigmap::SigmaError;

/// Shared inputs of every command
#[derive(Debug, Clone)]
pub struct OpContext {
    pub config_path: Option<PathBuf>,
    pub addr: Option<SocketAddr>,
}

impl OpContext {
    pub fn new(config_path: Option<PathBuf>, addr: Option<SocketAddr>) -> Self {
        Self { config_path, addr }
    }

    /// The server to dial: `--addr`, else the configured one, else the default
    pub fn server_addr(&self) -> SocketAddr {
        if let Some(addr) = self.addr {
            return addr;
        }
        match AppState::load(self.config_path.clone()) {
            Ok(state) => state.config.listen_addr,
            Err(e) => {
                tracing::debug!("no config, using the default address: {}", e);
                default_listen_addr()
            }
        }
    }

    /// Connect and attach a fresh session at the root
    pub async fn client(&self) -> Result<FdClient, SigmaError> {
        let sess = SessClnt::connect(self.server_addr()).await?;
        FdClient::attach(sess, "").await
    }
}

#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Output: fmt::Display + fmt::Debug + Send;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

/// Build a `Command` subcommand enum over ops, plus `OpOutput` and `OpError`
/// enums collecting their results, and make `Command` an [`Op`] itself.
#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $ty:ty)),* $(,)?) => {
        #[derive(clap::Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($ty),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$ty as $crate::cli::op::Op>::Output),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$ty as $crate::cli::op::Op>::Error),
            )*
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(OpOutput::$variant(output) => write!(f, "{output}"),)*
                }
            }
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Error = OpError;
            type Output = OpOutput;

            async fn execute(
                &self,
                ctx: &$crate::cli::op::OpContext,
            ) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => <$ty as $crate::cli::op::Op>::execute(op, ctx)
                            .await
                            .map(OpOutput::$variant)
                            .map_err(OpError::$variant),
                    )*
                }
            }
        }
    };
}
