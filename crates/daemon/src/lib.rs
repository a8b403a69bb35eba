// Service modules (daemon functionality)
pub mod process;
pub mod service_config;
pub mod service_state;

// App state (configuration, paths)
pub mod state;

pub use process::{spawn_service, start_service, ServiceError, ShutdownHandle};
pub use service_config::{Config as ServiceConfig, ConfigError};
pub use service_state::State as ServiceState;
pub use state::{AppConfig, AppState, StateError};

/// Version line reported by the CLI
pub fn build_info() -> String {
    format!(
        "sigmad {} (protocol {})",
        env!("CARGO_PKG_VERSION"),
        sigmap::VERSION
    )
}
