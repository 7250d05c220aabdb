use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::utils::WorkerPoolConfig;

pub static GLOBAL_CONFIG: OnceCell<ServerConfig> = OnceCell::new();
pub fn global_config() -> &'static ServerConfig {
    GLOBAL_CONFIG.get().unwrap()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// RLIMIT_NOFILE applied at startup, 0 leaves the limit untouched
    pub fd_table_size: usize,
    /// directory of the hourly rolling log files
    pub log_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            fd_table_size: 0,
            log_dir: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 8080,
            max_connection: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollerConfig {
    /// backend name resolved through the poller factory
    pub backend: String,
    pub timeout_secs: u64,
    pub max_events: usize,
    pub sweep_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(target_os = "linux") {
                "epoll".to_string()
            } else {
                "poll".to_string()
            },
            timeout_secs: 1,
            max_events: 4096,
            sweep_interval_ms: 1000,
        }
    }
}

impl PollerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StagePoolConfig {
    pub num_workers: usize,
    pub channel_capacity: usize,
    pub monitor_interval: u64,
    pub worker_check_timeout: u64,
}

impl Default for StagePoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            channel_capacity: 1024,
            monitor_interval: 5,
            worker_check_timeout: 200,
        }
    }
}

impl From<&StagePoolConfig> for WorkerPoolConfig {
    fn from(value: &StagePoolConfig) -> Self {
        WorkerPoolConfig {
            num_workers: value.num_workers,
            channel_capacity: value.channel_capacity,
            monitor_interval: Duration::from_secs(value.monitor_interval),
            worker_check_timeout: Duration::from_millis(value.worker_check_timeout),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub idle_timeout_secs: u64,
    pub max_keep_alive_requests: usize,
    pub response_buffer_size: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            max_keep_alive_requests: 100,
            response_buffer_size: 4096,
            max_header_size: 8 * 1024,
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub poller: PollerConfig,
    pub parser_stage: StagePoolConfig,
    pub handler_stage: StagePoolConfig,
    pub http: HttpConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("PIPESERV").separator("__"))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    fn validate(&self) -> AppResult<()> {
        for (name, pool) in [
            ("parser_stage", &self.parser_stage),
            ("handler_stage", &self.handler_stage),
        ] {
            if pool.num_workers == 0 {
                return Err(AppError::InvalidValue(format!(
                    "{name}.num_workers must be at least 1"
                )));
            }
            if pool.channel_capacity == 0 {
                return Err(AppError::InvalidValue(format!(
                    "{name}.channel_capacity must be at least 1"
                )));
            }
        }
        if self.poller.max_events == 0 {
            return Err(AppError::InvalidValue(
                "poller.max_events must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
