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

use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_channel::{SendError, TrySendError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::Shutdown;

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + Sync + 'static {
    /// Handle the task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers sharing the queue
    pub num_workers: usize,
    /// Queue Capacity, the queue is always bounded
    pub channel_capacity: usize,
    /// Monitor Interval
    pub monitor_interval: Duration,
    /// Worker Check Timeout param
    pub worker_check_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            channel_capacity: 1024,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

/// A named pool of workers pulling from one bounded FIFO queue.
///
/// Every worker is a tokio task; a monitor task restarts workers that
/// panicked or exited while the pool is still running.
#[derive(Debug)]
pub struct WorkerPool<T> {
    name: String,
    request_tx: async_channel::Sender<T>,
    config: WorkerPoolConfig,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> WorkerPool<T> {
    /// Spawns the workers on the current tokio runtime.
    pub fn new<H: PoolHandler<T>>(
        name: impl Into<String>,
        config: WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
    ) -> Self {
        let name = name.into();
        let (request_tx, request_rx) = async_channel::bounded(config.channel_capacity.max(1));

        let workers = (0..config.num_workers.max(1))
            .map(|id| {
                Self::spawn_worker(
                    &name,
                    id,
                    request_rx.clone(),
                    handler.clone(),
                    notify_shutdown.clone(),
                    shutdown_complete_tx.clone(),
                )
            })
            .collect();

        Self::spawn_monitor(
            name.clone(),
            workers,
            request_rx,
            handler,
            notify_shutdown,
            shutdown_complete_tx,
            config.clone(),
        );

        Self {
            name,
            request_tx,
            config,
        }
    }

    fn spawn_worker<H: PoolHandler<T>>(
        name: &str,
        id: usize,
        request_rx: async_channel::Receiver<T>,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Worker {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        let name = name.to_string();

        let handle = tokio::spawn(async move {
            // dropped when the worker exits, main waits for all of them
            let _shutdown_complete_tx = shutdown_complete_tx;
            debug!("{name} worker {id} started");

            loop {
                tokio::select! {
                    res = request_rx.recv() => {
                        match res {
                            Ok(task) => handler.handle(task).await,
                            Err(_) => {
                                debug!("{name} worker {id} queue closed");
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("{name} worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        name: String,
        mut workers: Vec<Worker>,
        request_rx: async_channel::Receiver<T>,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        config: WorkerPoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("{name} worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(config.worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    if request_rx.is_closed() {
                                        debug!("{name} queue closed, worker monitor exiting");
                                        return;
                                    }
                                    match join_result {
                                        Ok(_) => {
                                            warn!("{name} worker {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                log_worker_panic(&name, worker.id, err);
                                            } else {
                                                error!("{name} worker {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    warn!("{name} worker {} failed, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        &name,
                                        worker.id,
                                        request_rx.clone(),
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        shutdown_complete_tx.clone(),
                                    );
                                }
                                Err(_) => {
                                    trace!("{name} worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("{name} worker monitor exiting");
        });
    }

    /// Enqueue without waiting, a full queue hands the task back.
    pub fn try_send(&self, task: T) -> Result<(), TrySendError<T>> {
        self.request_tx.try_send(task)
    }

    /// Enqueue, waiting for free space in the queue.
    pub async fn send(&self, task: T) -> Result<(), SendError<T>> {
        self.request_tx.send(task).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.config.num_workers.max(1)
    }

    pub fn queue_len(&self) -> usize {
        self.request_tx.len()
    }

    pub fn get_pool_config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Stops accepting tasks; workers exit once the queue drains.
    pub fn close(&self) {
        self.request_tx.close();
    }
}

fn log_worker_panic(name: &str, worker_id: usize, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("{name} worker {worker_id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("{name} worker {worker_id} panicked with message: {message}");
    } else {
        error!(
            "{name} worker {worker_id} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
