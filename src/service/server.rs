// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tokio::{runtime, signal};
use tracing::{debug, error, info, trace, warn};

use super::config::ServerConfig;
use crate::http::{HttpConnectionFactory, HttpHandler, HttpHandlerStage, HttpParserStage};
use crate::pipeline::{Pipeline, PipelineOptions, StageSpec};
use crate::poller::{PollerFactory, PollerOptions};
use crate::utils::set_fdtable_size;
use crate::{AppError, AppResult};

/// Accepts TCP connections and hands them to the pipeline's poller.
///
/// The listener is the only socket driven by tokio. Accepted streams are
/// converted back to std sockets, from then on only the poller watches
/// them.
pub struct Server {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    max_connection: usize,
}

impl Server {
    pub fn new(listener: TcpListener, pipeline: Arc<Pipeline>, max_connection: usize) -> Self {
        Server {
            listener,
            pipeline,
            max_connection,
        }
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until the listener fails for good. Connections above
    /// `max_connection` are dropped right after accept.
    pub async fn run(&self) -> AppResult<()> {
        loop {
            let (socket, peer) = self.accept().await?;

            if self.pipeline.connection_count() >= self.max_connection {
                warn!(
                    "connection limit {} reached, dropping {peer}",
                    self.max_connection
                );
                continue;
            }

            let stream = match socket.into_std() {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("failed to detach socket of {peer}: {err}");
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                trace!("set_nodelay on {peer} failed: {err}");
            }
            match self.pipeline.register_connection(Box::new(stream)) {
                Ok(id) => debug!("accepted {peer} as connection {id}"),
                Err(err) => warn!("failed to register {peer}: {err}"),
            }
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!("accept tcp server error: {err}")));
                    }
                    warn!("accept failed, retrying in {backoff}s: {err}");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

/// Assembles the poller and the parser -> handler stage chain.
///
/// Must be called inside a tokio runtime, the stage pools spawn their
/// workers on it.
pub fn build_http_pipeline(
    config: &ServerConfig,
    handler: impl HttpHandler,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) -> AppResult<Arc<Pipeline>> {
    let poller_factory = PollerFactory::with_default_backends();
    let poller = poller_factory.create_poller(
        &config.poller.backend,
        &PollerOptions {
            max_events: config.poller.max_events,
        },
    )?;

    let stages = vec![
        StageSpec::new(HttpParserStage::new(), (&config.parser_stage).into()),
        StageSpec::new(
            HttpHandlerStage::new(
                handler,
                config.http.max_keep_alive_requests,
                config.http.response_buffer_size,
            ),
            (&config.handler_stage).into(),
        ),
    ];

    Pipeline::new(
        poller,
        Arc::new(HttpConnectionFactory::from(&config.http)),
        stages,
        PipelineOptions::from(&config.poller),
        notify_shutdown,
        shutdown_complete_tx,
    )
}

/// Runs the HTTP server until ctrl-c, then shuts every component down and
/// waits for them to finish.
pub fn run_http_server(config: &ServerConfig, handler: impl HttpHandler) -> AppResult<()> {
    if config.general.fd_table_size > 0 {
        set_fdtable_size(config.general.fd_table_size)?;
        info!("fd table size set to {}", config.general.fd_table_size);
    }

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let pipeline = {
        let _guard = rt.enter();
        build_http_pipeline(
            config,
            handler,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )?
    };
    let poller_thread = pipeline.spawn_poller(shutdown_complete_tx.clone())?;

    let result = rt.block_on(run_tcp_server(config, pipeline.clone()));

    // the receivers may all be gone already
    let _ = notify_shutdown.send(());
    drop(pipeline);
    drop(shutdown_complete_tx);
    if poller_thread.join().is_err() {
        error!("poller thread panicked");
    }
    trace!("waiting for shutdown complete...");
    rt.block_on(shutdown_complete_rx.recv());
    info!("server shutdown complete");
    result
}

async fn run_tcp_server(config: &ServerConfig, pipeline: Arc<Pipeline>) -> AppResult<()> {
    let listen_address = format!("{}:{}", config.network.ip, config.network.port);
    let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
        let error_msg = format!("failed to bind server to address: {listen_address} - error: {err}");
        error!(error_msg);
        AppError::IllegalStateError(error_msg)
    })?;
    info!("tcp server binding to {} for listening", &listen_address);

    let server = Server::new(listener, pipeline, config.network.max_connection);
    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
                return Err(err);
            }
        }
        _ = signal::ctrl_c() => {
            info!("get shutdown signal");
        }
    }
    Ok(())
}
