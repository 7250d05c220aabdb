use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use pipeserv::http::{HttpMethod, HttpRequest, HttpResponse, HttpResponseStatus};
use pipeserv::service::{run_http_server, setup_tracing};
use pipeserv::{global_config, AppError, AppResult, ServerConfig, GLOBAL_CONFIG};
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

/// Demo handler: greets on `/`, echoes request bodies on `/echo`.
fn hello(request: &HttpRequest, response: &mut HttpResponse<'_>) -> AppResult<()> {
    match (request.method(), request.path()) {
        (HttpMethod::Get, "/") => {
            response.add_header("Content-Type", "text/plain; charset=utf-8");
            response.write_data(b"hello from pipeserv\n")?;
        }
        (HttpMethod::Post, "/echo") => {
            let content_type = request
                .find_header_value("Content-Type")
                .unwrap_or("application/octet-stream")
                .to_string();
            response.add_header("Content-Type", content_type);
            response.write_data(request.body())?;
        }
        _ => {
            response.add_header("Content-Type", "text/plain; charset=utf-8");
            response.write_data(b"not found\n")?;
            response.respond(HttpResponseStatus::NOT_FOUND)?;
        }
    }
    Ok(())
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let server_config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{server_config:#?}");
        return Ok(());
    }

    GLOBAL_CONFIG
        .set(server_config)
        .map_err(|_| AppError::IllegalStateError("config already set".to_string()))?;

    let _tracing_guard = setup_tracing(&global_config().general.log_dir, commandline.verbose);
    info!(
        "pipeserv {} starting with {} poller",
        env!("CARGO_PKG_VERSION"),
        global_config().poller.backend
    );

    run_http_server(global_config(), hello)
}
