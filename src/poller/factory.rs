use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use super::{Poller, PollSelector, WatchedPoller, MAX_EVENT_PER_POLL};
use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// readiness entries handled per wait call
    pub max_events: usize,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            max_events: MAX_EVENT_PER_POLL,
        }
    }
}

pub type PollerConstructor = fn(&PollerOptions) -> AppResult<Box<dyn Poller>>;

/// Name-keyed registry of poller backends.
///
/// Filled during startup and only read afterwards. Registering a name twice
/// fails, the first registration stays in place.
#[derive(Default)]
pub struct PollerFactory {
    constructors: HashMap<String, PollerConstructor>,
}

impl PollerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every backend the current platform supports.
    pub fn with_default_backends() -> Self {
        let mut constructors: HashMap<String, PollerConstructor> = HashMap::new();
        #[cfg(target_os = "linux")]
        constructors.insert("epoll".to_string(), create_epoll_poller);
        constructors.insert("poll".to_string(), create_poll_poller);
        Self { constructors }
    }

    pub fn register_poller(&mut self, name: &str, constructor: PollerConstructor) -> AppResult<()> {
        if self.constructors.contains_key(name) {
            return Err(AppError::DuplicatePoller(name.to_string()));
        }
        debug!("register poller backend {name}");
        self.constructors.insert(name.to_string(), constructor);
        Ok(())
    }

    /// Unknown names are a configuration error, backend construction
    /// failures are fatal for the caller.
    pub fn create_poller(&self, name: &str, options: &PollerOptions) -> AppResult<Box<dyn Poller>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| AppError::UnknownPoller(name.to_string()))?;
        constructor(options)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PollerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerFactory")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn create_epoll_poller(options: &PollerOptions) -> AppResult<Box<dyn Poller>> {
    let selector = super::EpollSelector::new().map_err(|err| AppError::PollerCreate("epoll", err))?;
    Ok(Box::new(WatchedPoller::new(selector, options.max_events)))
}

fn create_poll_poller(options: &PollerOptions) -> AppResult<Box<dyn Poller>> {
    let selector = PollSelector::new().map_err(|err| AppError::PollerCreate("poll", err))?;
    Ok(Box::new(WatchedPoller::new(selector, options.max_events)))
}
