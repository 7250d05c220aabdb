use dotenv::dotenv;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::AppResult;
use crate::utils::parse_bool;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Keeps the non-blocking file writer alive, dropping it flushes pending lines.
pub struct TracingGuard {
    _worker_guard: WorkerGuard,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        tracing::info!("shutdown tracing writer");
    }
}

/// Maps `-v` occurrences on the command line to a default level,
/// `RUST_LOG` still wins when it is set.
pub fn verbosity_filter(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn env_filter(default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

/// stdout only, used by tests and small tools
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    // a second call in the same test binary is fine
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(LevelFilter::INFO))
        .try_init();
    Ok(())
}

/// stdout plus an hourly rolling file under `log_dir`. Colors are on
/// unless `PIPESERV_LOG_ANSI` says otherwise.
pub fn setup_tracing(log_dir: &str, verbose: u8) -> TracingGuard {
    let file_appender = tracing_appender::rolling::hourly(log_dir, "pipeserv.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    let writer = non_blocking.and(std::io::stdout);

    let ansi = std::env::var("PIPESERV_LOG_ANSI").map_or(true, |value| parse_bool(&value));

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(ansi)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(verbosity_filter(verbose)))
        .init();

    TracingGuard {
        _worker_guard: worker_guard,
    }
}
