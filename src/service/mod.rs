pub use app_error::{AppError, AppResult};
pub use config::{
    global_config, GeneralConfig, HttpConfig, NetworkConfig, PollerConfig, ServerConfig,
    StagePoolConfig, GLOBAL_CONFIG,
};
pub use server::{build_http_pipeline, run_http_server, Server};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, verbosity_filter, TracingGuard};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
