pub mod http;
pub mod network;
pub mod pipeline;
pub mod poller;
pub mod service;
pub mod utils;

pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, ServerConfig,
    Shutdown, GLOBAL_CONFIG,
};
