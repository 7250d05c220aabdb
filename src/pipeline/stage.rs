use crate::network::Connection;
use crate::utils::WorkerPoolConfig;
use crate::AppResult;

/// What the pipeline does with a connection after a stage ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Hand the connection to the next stage. From the last stage this
    /// behaves like `Rearm`.
    Forward,
    /// Drop the connection, its fd is closed by the factory.
    Close,
    /// Stop processing and wait for the next readiness report.
    Rearm,
}

/// Position of a stage in the chain, handed to [`Stage::initialize`].
#[derive(Debug, Clone)]
pub struct StageSetup {
    index: usize,
    stage_names: Vec<String>,
}

impl StageSetup {
    pub(crate) fn new(index: usize, stage_names: Vec<String>) -> Self {
        StageSetup { index, stage_names }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.stage_names.len()
    }

    pub fn next_stage(&self) -> Option<&str> {
        self.stage_names.get(self.index + 1).map(String::as_str)
    }

    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }
}

/// A named unit of work running on its own worker pool.
///
/// `process_task` must return promptly. A stage that needs more I/O returns
/// [`StageStatus::Rearm`] after setting the connection's interest, the
/// poller schedules it again once the socket is ready.
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called once before the stage accepts tasks.
    fn initialize(&mut self, _setup: &StageSetup) -> AppResult<()> {
        Ok(())
    }

    fn process_task(&self, conn: &mut Connection) -> StageStatus;
}

/// A stage together with the pool that runs it.
pub struct StageSpec {
    pub(crate) stage: Box<dyn Stage>,
    pub(crate) pool: WorkerPoolConfig,
}

impl StageSpec {
    pub fn new(stage: impl Stage, pool: WorkerPoolConfig) -> Self {
        StageSpec {
            stage: Box::new(stage),
            pool,
        }
    }
}
