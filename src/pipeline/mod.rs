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

//! Staged pipeline
//!
//! The pipeline owns the poller, the connection table and an ordered chain
//! of stages. The poller thread never does protocol work: a readiness report
//! takes the connection out of the poller and queues its id on the first
//! stage. A stage worker then decides whether the connection moves on to the
//! next stage, gets closed, or goes back to the poller.
//!
//! # Single task in flight
//!
//! Every table slot carries a `Polling`/`Scheduled`/`Closing` state changed
//! by compare-and-swap. Only the side that moves a slot out of `Polling`
//! may queue it, so a connection is never polled and queued at once, and
//! never sits in two stage queues. Poller registration changes happen while
//! holding the slot's connection lock, which keeps them ordered against a
//! concurrent close.

pub use stage::{Stage, StageSetup, StageSpec, StageStatus};
pub use table::SlotState;

mod stage;
mod table;

use std::any::Any;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use async_channel::TrySendError;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::network::{ConnectionFactory, ConnectionId, FdStream, Transport};
use crate::poller::{EventHandler, Poller, PollerEvent, Token};
use crate::service::PollerConfig;
use crate::utils::{PoolHandler, WorkerPool};
use crate::{AppError, AppResult, Shutdown};
use table::ConnectionSlot;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// upper bound of one poller wait, also the shutdown latency
    pub poll_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            poll_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl From<&PollerConfig> for PipelineOptions {
    fn from(config: &PollerConfig) -> Self {
        PipelineOptions {
            poll_timeout: config.timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

struct StageEntry {
    stage: Box<dyn Stage>,
    pool: WorkerPool<ConnectionId>,
}

pub struct Pipeline {
    poller: Box<dyn Poller>,
    factory: Arc<dyn ConnectionFactory>,
    connections: DashMap<ConnectionId, Arc<ConnectionSlot>>,
    next_id: AtomicU64,
    stages: Vec<StageEntry>,
    options: PipelineOptions,
    notify_shutdown: broadcast::Sender<()>,
}

/// Pool handler running one stage; holds the pipeline weakly so the pools
/// do not keep it alive.
#[derive(Clone)]
struct StageWorker {
    pipeline: Weak<Pipeline>,
    index: usize,
}

impl PoolHandler<ConnectionId> for StageWorker {
    fn handle(&self, id: ConnectionId) -> impl Future<Output = ()> + Send {
        let pipeline = self.pipeline.upgrade();
        let index = self.index;
        async move {
            if let Some(pipeline) = pipeline {
                pipeline.run_stage(index, id).await;
            }
        }
    }
}

impl Pipeline {
    /// Initializes every stage in order, then starts their worker pools on
    /// the current tokio runtime.
    pub fn new(
        poller: Box<dyn Poller>,
        factory: Arc<dyn ConnectionFactory>,
        stages: Vec<StageSpec>,
        options: PipelineOptions,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Arc<Pipeline>> {
        if stages.is_empty() {
            return Err(AppError::InvalidValue(
                "pipeline needs at least one stage".to_string(),
            ));
        }
        let stage_names: Vec<String> = stages.iter().map(|s| s.stage.name().to_string()).collect();
        let mut prepared = Vec::with_capacity(stages.len());
        for (index, mut spec) in stages.into_iter().enumerate() {
            spec.stage
                .initialize(&StageSetup::new(index, stage_names.clone()))?;
            prepared.push(spec);
        }

        let pipeline = Arc::new_cyclic(|weak: &Weak<Pipeline>| {
            let stages = prepared
                .into_iter()
                .enumerate()
                .map(|(index, spec)| {
                    let pool_name = format!("stage-{}", spec.stage.name());
                    let handler = StageWorker {
                        pipeline: weak.clone(),
                        index,
                    };
                    let pool = WorkerPool::new(
                        pool_name,
                        spec.pool,
                        notify_shutdown.clone(),
                        shutdown_complete_tx.clone(),
                        handler,
                    );
                    StageEntry {
                        stage: spec.stage,
                        pool,
                    }
                })
                .collect();
            Pipeline {
                poller,
                factory,
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                stages,
                options,
                notify_shutdown,
            }
        });

        info!(
            "pipeline ready, poller: {}, stages: {}",
            pipeline.poller.name(),
            stage_names.join(" -> ")
        );
        Ok(pipeline)
    }

    pub fn poller(&self) -> &dyn Poller {
        self.poller.as_ref()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|entry| entry.stage.name()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<SlotState> {
        self.slot(id).map(|slot| slot.state())
    }

    fn slot(&self, id: ConnectionId) -> Option<Arc<ConnectionSlot>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Builds a connection through the factory and starts polling it.
    pub fn register_connection(&self, transport: Box<dyn Transport>) -> AppResult<ConnectionId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = self.factory.create_connection(id, transport)?;
        let fd = conn.fd();
        self.connections
            .insert(id, Arc::new(ConnectionSlot::new(conn)));
        if !self.enable_poll(id) {
            return Err(AppError::InvalidOperation(format!(
                "cannot watch connection {id} fd {fd}"
            )));
        }
        debug!("registered connection {id} fd {fd}");
        Ok(id)
    }

    pub fn register_fd(&self, fd: OwnedFd) -> AppResult<ConnectionId> {
        self.register_connection(Box::new(FdStream::from(fd)))
    }

    /// Takes the connection out of the poller. Returns false if it was not
    /// being polled.
    pub fn disable_poll(&self, id: ConnectionId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let guard = slot.conn.lock();
        guard.is_some() && self.claim(&slot)
    }

    /// Hands the connection back to the poller with its current interest.
    /// A connection that cannot be watched again is closed.
    pub fn enable_poll(&self, id: ConnectionId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let guard = slot.conn.lock();
        let Some(conn) = guard.as_ref() else {
            return false;
        };
        if slot.state() != SlotState::Scheduled {
            debug!("connection {id} is not scheduled, nothing to re-arm");
            return false;
        }
        // added before the state flips, a report in between is delivered again
        if !self.poller.add_fd(slot.fd, id, conn.interest()) {
            drop(guard);
            warn!("re-arm connection {id} failed, closing it");
            self.close_connection(id);
            return false;
        }
        slot.transition(SlotState::Scheduled, SlotState::Polling)
    }

    /// Must be called with the slot's connection lock held.
    fn claim(&self, slot: &ConnectionSlot) -> bool {
        if !slot.transition(SlotState::Polling, SlotState::Scheduled) {
            return false;
        }
        if !self.poller.remove_fd(slot.fd) {
            warn!("fd {} stays registered while its connection is scheduled", slot.fd);
        }
        true
    }

    /// Removes the connection and hands it to the factory. Waits for a
    /// stage that is currently running on it.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        let Some((_, slot)) = self.connections.remove(&id) else {
            return false;
        };
        let conn = {
            let mut guard = slot.conn.lock();
            if slot.begin_close() == SlotState::Polling {
                self.poller.remove_fd(slot.fd);
            }
            guard.take()
        };
        match conn {
            Some(conn) => {
                debug!("closing connection {id} fd {}", slot.fd);
                self.factory.destroy_connection(conn);
                true
            }
            None => false,
        }
    }

    pub fn close_all_connections(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.close_connection(*id))
            .count()
    }

    /// Closes polled connections that saw no traffic within their timeout.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let expired: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().state() == SlotState::Polling)
            .filter_map(|entry| {
                let guard = entry.value().conn.try_lock()?;
                guard
                    .as_ref()
                    .filter(|conn| conn.is_idle(now))
                    .map(|conn| conn.id())
            })
            .collect();

        let mut closed = 0;
        for id in expired {
            if self.connection_state(id) == Some(SlotState::Polling) && self.close_connection(id) {
                closed += 1;
            }
        }
        if closed > 0 {
            info!("closed {closed} idle connections");
        }
        closed
    }

    fn dispatch(&self, token: Token, events: PollerEvent) {
        let Some(slot) = self.slot(token) else {
            trace!("readiness for unknown connection {token} dropped");
            return;
        };
        if slot.state() != SlotState::Polling {
            return;
        }
        {
            // the poller thread never waits for a stage
            let Some(mut guard) = slot.conn.try_lock() else {
                return;
            };
            let Some(conn) = guard.as_mut() else {
                return;
            };
            if !self.claim(&slot) {
                return;
            }
            conn.set_readiness(events);
        }

        let first = &self.stages[0];
        match first.pool.try_send(token) {
            Ok(()) => trace!("connection {token} queued on {} for {events:?}", first.stage.name()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    "stage {} queue is full, closing connection {token}",
                    first.stage.name()
                );
                self.close_connection(token);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("stage {} is stopped, closing connection {token}", first.stage.name());
                self.close_connection(token);
            }
        }
    }

    async fn run_stage(&self, index: usize, id: ConnectionId) {
        let Some(slot) = self.slot(id) else {
            trace!("connection {id} closed before stage {index} ran");
            return;
        };
        let entry = &self.stages[index];
        let status = {
            let mut guard = slot.conn.lock();
            let Some(conn) = guard.as_mut() else {
                return;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| entry.stage.process_task(conn))) {
                Ok(status) => status,
                Err(payload) => {
                    error!(
                        "stage {} panicked on connection {id}: {}",
                        entry.stage.name(),
                        panic_message(payload.as_ref())
                    );
                    StageStatus::Close
                }
            }
        };

        match status {
            StageStatus::Forward => match self.stages.get(index + 1) {
                Some(next) => {
                    if next.pool.send(id).await.is_err() {
                        debug!("stage {} is stopped, closing connection {id}", next.stage.name());
                        self.close_connection(id);
                    }
                }
                None => {
                    debug!(
                        "last stage {} forwarded connection {id}, re-arming",
                        entry.stage.name()
                    );
                    self.enable_poll(id);
                }
            },
            StageStatus::Close => {
                self.close_connection(id);
            }
            StageStatus::Rearm => {
                self.enable_poll(id);
            }
        }
    }

    /// Runs the poller loop on a dedicated thread until shutdown is
    /// broadcast, then closes the remaining connections.
    pub fn spawn_poller(
        self: &Arc<Self>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<thread::JoinHandle<()>> {
        let pipeline = Arc::clone(self);
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let handle = thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || {
                let _shutdown_complete_tx = shutdown_complete_tx;
                let mut dispatcher = PollerDispatch::new(&pipeline);
                pipeline.poller.handle_event(
                    pipeline.options.poll_timeout,
                    &mut shutdown,
                    &mut dispatcher,
                );
                let closed = pipeline.close_all_connections();
                info!("poller stopped, closed {closed} connections");
            })?;
        Ok(handle)
    }
}

/// Bridges poller callbacks to the pipeline.
struct PollerDispatch<'a> {
    pipeline: &'a Pipeline,
    last_sweep: Instant,
}

impl<'a> PollerDispatch<'a> {
    fn new(pipeline: &'a Pipeline) -> Self {
        PollerDispatch {
            pipeline,
            last_sweep: Instant::now(),
        }
    }
}

impl EventHandler for PollerDispatch<'_> {
    fn on_event(&mut self, token: Token, events: PollerEvent) {
        self.pipeline.dispatch(token, events);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) >= self.pipeline.options.sweep_interval {
            self.pipeline.sweep_idle(now);
            self.last_sweep = now;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::MockTransport;
    use crate::network::{Connection, IoStatus, PlainConnectionFactory, Request, Response};
    use crate::poller::tests::FakeSelector;
    use crate::poller::{PollSelector, WatchedPoller};
    use crate::utils::WorkerPoolConfig;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    fn pool(num_workers: usize, channel_capacity: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers,
            channel_capacity,
            monitor_interval: Duration::from_millis(50),
            worker_check_timeout: Duration::from_millis(10),
        }
    }

    fn build(
        stages: Vec<StageSpec>,
        timeout: Option<Duration>,
    ) -> (Arc<Pipeline>, broadcast::Sender<()>, mpsc::Receiver<()>) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let pipeline = Pipeline::new(
            Box::new(WatchedPoller::new(FakeSelector::default(), 64)),
            Arc::new(PlainConnectionFactory { timeout }),
            stages,
            PipelineOptions::default(),
            notify_shutdown.clone(),
            shutdown_complete_tx,
        )
        .unwrap();
        (pipeline, notify_shutdown, shutdown_complete_rx)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    /// Counts concurrent visits per connection across every stage it is
    /// shared with.
    #[derive(Clone, Default)]
    struct Probe {
        in_flight: Arc<Mutex<HashMap<ConnectionId, usize>>>,
        violations: Arc<AtomicUsize>,
        processed: Arc<AtomicUsize>,
    }

    struct ProbeStage {
        name: &'static str,
        probe: Probe,
        status: StageStatus,
    }

    impl Stage for ProbeStage {
        fn name(&self) -> &str {
            self.name
        }

        fn process_task(&self, conn: &mut Connection) -> StageStatus {
            {
                let mut in_flight = self.probe.in_flight.lock();
                let count = in_flight.entry(conn.id()).or_default();
                if *count != 0 {
                    self.probe.violations.fetch_add(1, Ordering::SeqCst);
                }
                *count += 1;
            }
            conn.read_buf.extend_from_slice(b"x");
            thread::sleep(Duration::from_micros(200));
            *self.probe.in_flight.lock().get_mut(&conn.id()).unwrap() -= 1;
            self.probe.processed.fetch_add(1, Ordering::SeqCst);
            self.status
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_task_in_flight_under_random_events() {
        let probe = Probe::default();
        let stages = vec![
            StageSpec::new(
                ProbeStage {
                    name: "first",
                    probe: probe.clone(),
                    status: StageStatus::Forward,
                },
                pool(4, 64),
            ),
            StageSpec::new(
                ProbeStage {
                    name: "second",
                    probe: probe.clone(),
                    status: StageStatus::Rearm,
                },
                pool(4, 64),
            ),
        ];
        let (pipeline, _notify, _complete) = build(stages, None);
        let ids: Vec<ConnectionId> = (0..8)
            .map(|_| {
                pipeline
                    .register_connection(Box::new(MockTransport::default()))
                    .unwrap()
            })
            .collect();

        let injector = Arc::clone(&pipeline);
        let tokens = ids.clone();
        tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(7);
            let mut dispatch = PollerDispatch::new(&injector);
            for _ in 0..3000 {
                // some tokens belong to no connection at all
                let token = if rng.gen_bool(0.05) {
                    10_000 + rng.gen_range(0..10)
                } else {
                    tokens[rng.gen_range(0..tokens.len())]
                };
                let events = PollerEvent::from_bits_truncate(rng.gen_range(1..16));
                dispatch.on_event(token, events);
                if rng.gen_bool(0.1) {
                    thread::sleep(Duration::from_micros(100));
                }
            }
        })
        .await
        .unwrap();

        let settled = wait_until(|| {
            ids.iter()
                .all(|id| pipeline.connection_state(*id) == Some(SlotState::Polling))
        })
        .await;
        assert!(settled);
        assert_eq!(probe.violations.load(Ordering::SeqCst), 0);
        assert!(probe.processed.load(Ordering::SeqCst) > 0);
        assert_eq!(pipeline.poller().watched_count(), ids.len());
    }

    /// Appends every byte it reads to the connection payload.
    struct RecordStage;

    impl Stage for RecordStage {
        fn name(&self) -> &str {
            "record"
        }

        fn process_task(&self, conn: &mut Connection) -> StageStatus {
            let mut buf = [0u8; 64];
            let mut seen = Vec::new();
            let mut request = Request::new(conn);
            while let Ok(IoStatus::Complete(n)) = request.read_data(&mut buf) {
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            if conn.payload_ref::<Vec<u8>>().is_none() {
                conn.set_payload(Vec::<u8>::new());
            }
            if let Some(record) = conn.payload_mut::<Vec<u8>>() {
                record.extend_from_slice(&seen);
            }
            StageStatus::Rearm
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tasks_of_one_connection_keep_order() {
        let (pipeline, _notify, _complete) =
            build(vec![StageSpec::new(RecordStage, pool(4, 16))], None);
        let transport = MockTransport::default();
        let id = pipeline
            .register_connection(Box::new(transport.clone()))
            .unwrap();

        let mut dispatch = PollerDispatch::new(&pipeline);
        for i in 0..100u8 {
            assert!(wait_until(|| pipeline.connection_state(id) == Some(SlotState::Polling)).await);
            transport.push_input(&[i]);
            // a report that races the re-arm is dropped, a real poller reports it again
            for _ in 0..100 {
                dispatch.on_event(id, PollerEvent::READ);
                if !transport.has_input() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        assert!(wait_until(|| pipeline.connection_state(id) == Some(SlotState::Polling)).await);

        let slot = pipeline.slot(id).unwrap();
        let guard = slot.conn.lock();
        let record = guard.as_ref().unwrap().payload_ref::<Vec<u8>>().unwrap();
        assert_eq!(record, &(0..100u8).collect::<Vec<_>>());
    }

    /// Blocks its worker until released by the test.
    struct GateStage {
        started: std_mpsc::Sender<ConnectionId>,
        release: Mutex<std_mpsc::Receiver<()>>,
    }

    impl Stage for GateStage {
        fn name(&self) -> &str {
            "gate"
        }

        fn process_task(&self, conn: &mut Connection) -> StageStatus {
            let _ = self.started.send(conn.id());
            let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
            StageStatus::Rearm
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_first_stage_closes_connection() {
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let stage = GateStage {
            started: started_tx,
            release: Mutex::new(release_rx),
        };
        let (pipeline, _notify, _complete) = build(vec![StageSpec::new(stage, pool(1, 1))], None);
        let ids: Vec<ConnectionId> = (0..3)
            .map(|_| {
                pipeline
                    .register_connection(Box::new(MockTransport::default()))
                    .unwrap()
            })
            .collect();

        let mut dispatch = PollerDispatch::new(&pipeline);
        dispatch.on_event(ids[0], PollerEvent::READ);
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)), Ok(ids[0]));
        // the only worker is busy, one slot left in the queue
        dispatch.on_event(ids[1], PollerEvent::READ);
        dispatch.on_event(ids[2], PollerEvent::READ);

        assert_eq!(pipeline.connection_state(ids[2]), None);
        assert_eq!(pipeline.connection_count(), 2);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert!(
            wait_until(|| pipeline.connection_state(ids[1]) == Some(SlotState::Polling)).await
        );
        assert!(pipeline.poller().watched_count() == 2);
    }

    #[tokio::test]
    async fn test_idle_sweep_skips_scheduled_connections() {
        let probe = Probe::default();
        let stage = ProbeStage {
            name: "probe",
            probe,
            status: StageStatus::Rearm,
        };
        let (pipeline, _notify, _complete) = build(
            vec![StageSpec::new(stage, pool(1, 8))],
            Some(Duration::from_millis(10)),
        );
        let idle = pipeline
            .register_connection(Box::new(MockTransport::default()))
            .unwrap();
        let busy = pipeline
            .register_connection(Box::new(MockTransport::default()))
            .unwrap();
        assert!(pipeline.disable_poll(busy));
        assert!(!pipeline.disable_poll(busy));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(pipeline.sweep_idle(later), 1);
        assert_eq!(pipeline.connection_state(idle), None);
        assert_eq!(pipeline.connection_state(busy), Some(SlotState::Scheduled));
        assert_eq!(pipeline.poller().watched_count(), 0);

        assert!(pipeline.enable_poll(busy));
        assert_eq!(pipeline.poller().watched_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_token_is_ignored() {
        let probe = Probe::default();
        let stage = ProbeStage {
            name: "probe",
            probe: probe.clone(),
            status: StageStatus::Rearm,
        };
        let (pipeline, _notify, _complete) = build(vec![StageSpec::new(stage, pool(1, 8))], None);
        let id = pipeline
            .register_connection(Box::new(MockTransport::default()))
            .unwrap();
        assert!(pipeline.close_connection(id));
        assert!(!pipeline.close_connection(id));

        let mut dispatch = PollerDispatch::new(&pipeline);
        dispatch.on_event(id, PollerEvent::READ);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.processed.load(Ordering::SeqCst), 0);
        assert!(!pipeline.enable_poll(id));
        assert_eq!(pipeline.poller().watched_count(), 0);
    }

    struct PanicStage;

    impl Stage for PanicStage {
        fn name(&self) -> &str {
            "panic"
        }

        fn process_task(&self, _conn: &mut Connection) -> StageStatus {
            panic!("stage failure");
        }
    }

    #[tokio::test]
    async fn test_stage_panic_closes_connection() {
        let (pipeline, _notify, _complete) =
            build(vec![StageSpec::new(PanicStage, pool(1, 8))], None);
        let id = pipeline
            .register_connection(Box::new(MockTransport::default()))
            .unwrap();
        PollerDispatch::new(&pipeline).on_event(id, PollerEvent::READ);
        assert!(wait_until(|| pipeline.connection_count() == 0).await);
        assert_eq!(pipeline.poller().watched_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_from_last_stage_rearms() {
        let probe = Probe::default();
        let stage = ProbeStage {
            name: "only",
            probe: probe.clone(),
            status: StageStatus::Forward,
        };
        let (pipeline, _notify, _complete) = build(vec![StageSpec::new(stage, pool(1, 8))], None);
        let id = pipeline
            .register_connection(Box::new(MockTransport::default()))
            .unwrap();
        PollerDispatch::new(&pipeline).on_event(id, PollerEvent::READ);
        assert!(wait_until(|| probe.processed.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(|| pipeline.connection_state(id) == Some(SlotState::Polling)).await);
    }

    struct NamedStage(&'static str);

    impl Stage for NamedStage {
        fn name(&self) -> &str {
            self.0
        }

        fn initialize(&mut self, setup: &StageSetup) -> AppResult<()> {
            if setup.index() == 0 && setup.next_stage().is_none() {
                return Err(AppError::IllegalStateError(format!(
                    "{} needs a downstream stage",
                    self.0
                )));
            }
            Ok(())
        }

        fn process_task(&self, _conn: &mut Connection) -> StageStatus {
            StageStatus::Rearm
        }
    }

    #[tokio::test]
    async fn test_stage_initialize_sees_chain() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let result = Pipeline::new(
            Box::new(WatchedPoller::new(FakeSelector::default(), 8)),
            Arc::new(PlainConnectionFactory::default()),
            vec![StageSpec::new(NamedStage("parser"), pool(1, 1))],
            PipelineOptions::default(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));

        let result = Pipeline::new(
            Box::new(WatchedPoller::new(FakeSelector::default(), 8)),
            Arc::new(PlainConnectionFactory::default()),
            Vec::new(),
            PipelineOptions::default(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        assert!(matches!(result, Err(AppError::InvalidValue(_))));

        let (pipeline, _notify, _complete) = build(
            vec![
                StageSpec::new(NamedStage("parser"), pool(1, 1)),
                StageSpec::new(NamedStage("handler"), pool(1, 1)),
            ],
            None,
        );
        assert_eq!(pipeline.stage_names(), vec!["parser", "handler"]);
    }

    /// Echoes whatever it reads, waiting for WRITE readiness when the
    /// socket pushes back.
    struct EchoStage;

    impl Stage for EchoStage {
        fn name(&self) -> &str {
            "echo"
        }

        fn process_task(&self, conn: &mut Connection) -> StageStatus {
            let mut buf = [0u8; 1024];
            loop {
                match Request::new(conn).read_data(&mut buf) {
                    Ok(IoStatus::Complete(0)) | Err(_) => return StageStatus::Close,
                    Ok(IoStatus::Complete(n)) => {
                        let mut response = Response::new(conn, 1024);
                        if response.write_data(&buf[..n]).is_err() {
                            return StageStatus::Close;
                        }
                    }
                    Ok(IoStatus::WouldBlock) => break,
                }
            }
            match Response::new(conn, 1024).flush_data() {
                Ok(IoStatus::WouldBlock) => conn.want_write(),
                Ok(_) => conn.want_read(),
                Err(_) => return StageStatus::Close,
            }
            StageStatus::Rearm
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poller_thread_echo_and_shutdown() -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let pipeline = Pipeline::new(
            Box::new(WatchedPoller::new(PollSelector::new()?, 64)),
            Arc::new(PlainConnectionFactory::default()),
            vec![StageSpec::new(EchoStage, pool(2, 16))],
            PipelineOptions {
                poll_timeout: Duration::from_millis(50),
                sweep_interval: Duration::from_millis(50),
            },
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )?;
        let poller_thread = pipeline.spawn_poller(shutdown_complete_tx)?;

        let (server_side, mut client) = UnixStream::pair()?;
        server_side.set_nonblocking(true)?;
        pipeline.register_connection(Box::new(server_side))?;

        client.set_read_timeout(Some(Duration::from_secs(5)))?;
        let echoed = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            client.write_all(b"ping")?;
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf)?;
            Ok(buf.to_vec())
        })
        .await
        .unwrap()?;
        assert_eq!(echoed, b"ping");

        notify_shutdown.send(()).unwrap();
        tokio::task::spawn_blocking(move || poller_thread.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pipeline.connection_count(), 0);

        drop(pipeline);
        // every worker and the poller thread released their senders
        assert!(shutdown_complete_rx.recv().await.is_none());
        Ok(())
    }
}
