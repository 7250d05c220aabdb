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

//! I/O readiness poller
//!
//! A [`Poller`] watches file descriptors and reports readiness to a single
//! [`EventHandler`]. Backends are small [`Selector`] implementations over an
//! OS facility; [`WatchedPoller`] layers the watched-fd bookkeeping on top
//! so that every backend shares the same rollback rules:
//!
//! - the watched set always mirrors what the OS has registered,
//! - `EEXIST` on add and `ENOENT` on remove are not failures,
//! - any other OS failure restores the previous set membership.
//!
//! Backends are selected by name through the [`PollerFactory`].

pub use event::{PollerEvent, Token};
pub use factory::{PollerConstructor, PollerFactory, PollerOptions};
pub use poll::PollSelector;

#[cfg(target_os = "linux")]
pub use epoll::EpollSelector;

#[cfg(target_os = "linux")]
mod epoll;
mod event;
mod factory;
mod poll;

use std::collections::HashSet;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::Shutdown;

/// Upper bound of ready descriptors handled per wait call.
pub const MAX_EVENT_PER_POLL: usize = 4096;

/// Receives readiness from [`Poller::handle_event`].
pub trait EventHandler {
    fn on_event(&mut self, token: Token, events: PollerEvent);

    /// Called once after every wait returns, with or without events.
    fn on_tick(&mut self) {}
}

/// Readiness notifier over a set of file descriptors.
///
/// `add_fd` and `remove_fd` may be called from any thread while another
/// thread is blocked in `handle_event`. Calls for the same fd are serialized.
pub trait Poller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Watches `fd` for `events`, delivering `token` with every readiness
    /// report. Adding an fd that is already registered updates its mask.
    fn add_fd(&self, fd: RawFd, token: Token, events: PollerEvent) -> bool;

    fn remove_fd(&self, fd: RawFd) -> bool;

    fn is_watched(&self, fd: RawFd) -> bool;

    fn watched_count(&self) -> usize;

    /// Runs the wait/dispatch loop until `shutdown` fires. The signal is
    /// checked after each bounded wait, so it takes effect within `timeout`.
    fn handle_event(
        &self,
        timeout: Duration,
        shutdown: &mut Shutdown,
        handler: &mut dyn EventHandler,
    );
}

/// Thin adapter over one OS readiness facility.
///
/// Errors carry the raw OS error so the caller can tell `EEXIST` and
/// `ENOENT` apart from real failures.
pub trait Selector: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn register(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()>;
    fn reregister(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()>;
    fn deregister(&self, fd: RawFd) -> io::Result<()>;
    /// Appends at most `max_events` ready entries. An interrupted wait is
    /// reported as success with no events.
    fn select(
        &self,
        events: &mut Vec<(Token, PollerEvent)>,
        max_events: usize,
        timeout: Duration,
    ) -> io::Result<()>;
}

/// A [`Poller`] built from a [`Selector`] plus the watched fd set.
pub struct WatchedPoller<S: Selector> {
    selector: S,
    watched: Mutex<HashSet<RawFd>>,
    max_events: usize,
}

impl<S: Selector> WatchedPoller<S> {
    pub fn new(selector: S, max_events: usize) -> Self {
        WatchedPoller {
            selector,
            watched: Mutex::new(HashSet::new()),
            max_events: max_events.clamp(1, MAX_EVENT_PER_POLL),
        }
    }

    pub fn selector(&self) -> &S {
        &self.selector
    }
}

fn is_os_error(err: &io::Error, code: i32) -> bool {
    err.raw_os_error() == Some(code)
}

impl<S: Selector> Poller for WatchedPoller<S> {
    fn name(&self) -> &'static str {
        self.selector.name()
    }

    fn add_fd(&self, fd: RawFd, token: Token, events: PollerEvent) -> bool {
        // held across the OS call so the set and the OS move together
        let mut watched = self.watched.lock();
        let inserted = watched.insert(fd);

        match self.selector.register(fd, token, events) {
            Ok(()) => {
                trace!("{} watching fd {fd} for {events:?}", self.name());
                true
            }
            Err(err) if is_os_error(&err, libc::EEXIST) => {
                match self.selector.reregister(fd, token, events) {
                    Ok(()) => {
                        trace!("{} updated fd {fd} to {events:?}", self.name());
                        true
                    }
                    Err(err) => {
                        if is_os_error(&err, libc::ENOENT) {
                            watched.remove(&fd);
                        }
                        warn!("{} update mask of fd {fd} failed: {err}", self.name());
                        false
                    }
                }
            }
            Err(err) => {
                if inserted {
                    watched.remove(&fd);
                }
                warn!("{} add fd {fd} failed, fd is not watched: {err}", self.name());
                false
            }
        }
    }

    fn remove_fd(&self, fd: RawFd) -> bool {
        let mut watched = self.watched.lock();
        if !watched.remove(&fd) {
            warn!("{} remove fd {fd} failed, fd is not watched", self.name());
            return false;
        }

        match self.selector.deregister(fd) {
            Ok(()) => true,
            Err(err) if is_os_error(&err, libc::ENOENT) => {
                debug!("{} fd {fd} was already gone from the os", self.name());
                true
            }
            Err(err) => {
                warn!("{} remove fd {fd} failed, re-add the fd: {err}", self.name());
                watched.insert(fd);
                false
            }
        }
    }

    fn is_watched(&self, fd: RawFd) -> bool {
        self.watched.lock().contains(&fd)
    }

    fn watched_count(&self) -> usize {
        self.watched.lock().len()
    }

    fn handle_event(
        &self,
        timeout: Duration,
        shutdown: &mut Shutdown,
        handler: &mut dyn EventHandler,
    ) {
        let mut ready = Vec::with_capacity(self.max_events);
        debug!("{} event loop started", self.name());
        loop {
            ready.clear();
            // a failing wait is retried right away, these are rare os conditions
            match self.selector.select(&mut ready, self.max_events, timeout) {
                Ok(()) => {
                    for (token, events) in ready.drain(..) {
                        handler.on_event(token, events);
                    }
                }
                Err(err) => warn!("error in {} wait: {err}", self.name()),
            }
            handler.on_tick();
            if shutdown.try_recv() {
                break;
            }
        }
        debug!("{} event loop exited", self.name());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::broadcast;

    /// In-memory selector that behaves like epoll for registration and can
    /// be told to fail the next calls with a given errno.
    #[derive(Default)]
    pub(crate) struct FakeSelector {
        registered: Mutex<HashMap<RawFd, (Token, PollerEvent)>>,
        failures: Mutex<VecDeque<i32>>,
        ready: Mutex<Vec<(Token, PollerEvent)>>,
    }

    impl FakeSelector {
        pub(crate) fn fail_next(&self, errno: i32) {
            self.failures.lock().push_back(errno);
        }
        pub(crate) fn is_registered(&self, fd: RawFd) -> bool {
            self.registered.lock().contains_key(&fd)
        }
        pub(crate) fn mask_of(&self, fd: RawFd) -> Option<PollerEvent> {
            self.registered.lock().get(&fd).map(|(_, evt)| *evt)
        }
        /// registers behind the poller's back
        pub(crate) fn register_out_of_band(&self, fd: RawFd) {
            self.registered.lock().insert(fd, (0, PollerEvent::READ));
        }
        pub(crate) fn push_ready(&self, token: Token, events: PollerEvent) {
            self.ready.lock().push((token, events));
        }
        fn injected(&self) -> Option<io::Error> {
            self.failures
                .lock()
                .pop_front()
                .map(io::Error::from_raw_os_error)
        }
    }

    impl Selector for FakeSelector {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn register(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()> {
            if let Some(err) = self.injected() {
                return Err(err);
            }
            let mut registered = self.registered.lock();
            if registered.contains_key(&fd) {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            registered.insert(fd, (token, events));
            Ok(())
        }
        fn reregister(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()> {
            if let Some(err) = self.injected() {
                return Err(err);
            }
            match self.registered.lock().get_mut(&fd) {
                Some(entry) => {
                    *entry = (token, events);
                    Ok(())
                }
                None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
            }
        }
        fn deregister(&self, fd: RawFd) -> io::Result<()> {
            if let Some(err) = self.injected() {
                return Err(err);
            }
            match self.registered.lock().remove(&fd) {
                Some(_) => Ok(()),
                None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
            }
        }
        fn select(
            &self,
            events: &mut Vec<(Token, PollerEvent)>,
            max_events: usize,
            timeout: Duration,
        ) -> io::Result<()> {
            let mut ready = self.ready.lock();
            if ready.is_empty() {
                drop(ready);
                std::thread::sleep(timeout);
                return Ok(());
            }
            let take = ready.len().min(max_events);
            events.extend(ready.drain(..take));
            Ok(())
        }
    }

    fn fake_poller() -> WatchedPoller<FakeSelector> {
        WatchedPoller::new(FakeSelector::default(), 16)
    }

    #[test]
    fn test_add_and_remove() {
        let poller = fake_poller();
        assert!(poller.add_fd(3, 30, PollerEvent::READ));
        assert!(poller.is_watched(3));
        assert!(poller.selector().is_registered(3));
        assert!(poller.remove_fd(3));
        assert!(!poller.is_watched(3));
        assert!(!poller.selector().is_registered(3));
        // removing twice reports failure without touching the os
        assert!(!poller.remove_fd(3));
    }

    #[test]
    fn test_add_existing_updates_mask() {
        let poller = fake_poller();
        assert!(poller.add_fd(4, 40, PollerEvent::READ));
        assert!(poller.add_fd(4, 40, PollerEvent::WRITE));
        assert_eq!(poller.selector().mask_of(4), Some(PollerEvent::WRITE));
        assert_eq!(poller.watched_count(), 1);
    }

    #[test]
    fn test_add_with_already_exists_is_success() {
        let poller = fake_poller();
        // the os already knows fd 7 although the poller does not
        poller.selector().register_out_of_band(7);
        assert!(poller.add_fd(7, 70, PollerEvent::READ));
        assert!(poller.is_watched(7));
    }

    #[test]
    fn test_add_with_injected_already_exists_is_success() {
        let poller = fake_poller();
        poller.selector().fail_next(libc::EEXIST);
        poller.selector().register_out_of_band(7);
        assert!(poller.add_fd(7, 70, PollerEvent::READ));
        assert!(poller.is_watched(7));
    }

    #[test]
    fn test_add_with_other_failure_rolls_back() {
        let poller = fake_poller();
        poller.selector().fail_next(libc::ENOMEM);
        assert!(!poller.add_fd(7, 70, PollerEvent::READ));
        assert!(!poller.is_watched(7));
        assert!(!poller.selector().is_registered(7));
    }

    #[test]
    fn test_failed_mask_update_keeps_fd_watched() {
        let poller = fake_poller();
        assert!(poller.add_fd(5, 50, PollerEvent::READ));
        // EEXIST from the add path, then the update fails
        poller.selector().fail_next(libc::ENOMEM);
        assert!(!poller.add_fd(5, 50, PollerEvent::WRITE));
        // registration itself survived, so the fd stays watched
        assert!(poller.is_watched(5));
        assert!(poller.selector().is_registered(5));
    }

    #[test]
    fn test_remove_failure_re_adds() {
        let poller = fake_poller();
        assert!(poller.add_fd(9, 90, PollerEvent::READ));
        poller.selector().fail_next(libc::EBADF);
        assert!(!poller.remove_fd(9));
        assert!(poller.is_watched(9));
        assert!(poller.selector().is_registered(9));
    }

    #[test]
    fn test_remove_not_registered_in_os_is_success() {
        let poller = fake_poller();
        assert!(poller.add_fd(11, 110, PollerEvent::READ));
        poller.selector().fail_next(libc::ENOENT);
        assert!(poller.remove_fd(11));
        assert!(!poller.is_watched(11));
    }

    #[test]
    fn test_watched_set_mirrors_os_under_random_failures() {
        let poller = fake_poller();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let errnos = [libc::ENOMEM, libc::EBADF, libc::EPERM, libc::ENOSPC];

        for _ in 0..5_000 {
            let fd: RawFd = rng.gen_range(0..8);
            if rng.gen_bool(0.3) {
                poller
                    .selector()
                    .fail_next(errnos[rng.gen_range(0..errnos.len())]);
            }
            let events = PollerEvent::from_bits_truncate(rng.gen_range(1..16));
            if rng.gen_bool(0.5) {
                poller.add_fd(fd, fd as Token, events);
            } else {
                poller.remove_fd(fd);
            }
            // an injected failure may not have been consumed
            poller.selector().failures.lock().clear();
            for fd in 0..8 {
                assert_eq!(
                    poller.is_watched(fd),
                    poller.selector().is_registered(fd),
                    "fd {fd} drifted"
                );
            }
        }
    }

    struct Collect {
        seen: Vec<(Token, PollerEvent)>,
        ticks: usize,
        notify: broadcast::Sender<()>,
        stop_after: usize,
    }

    impl EventHandler for Collect {
        fn on_event(&mut self, token: Token, events: PollerEvent) {
            self.seen.push((token, events));
        }
        fn on_tick(&mut self) {
            self.ticks += 1;
            if self.ticks == self.stop_after {
                let _ = self.notify.send(());
            }
        }
    }

    #[test]
    fn test_handle_event_dispatches_and_stops_on_shutdown() {
        let poller = fake_poller();
        poller.selector().push_ready(1, PollerEvent::READ);
        poller
            .selector()
            .push_ready(2, PollerEvent::WRITE | PollerEvent::HUP);

        let (notify, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(notify.subscribe());
        let mut handler = Collect {
            seen: Vec::new(),
            ticks: 0,
            notify,
            stop_after: 3,
        };
        poller.handle_event(Duration::from_millis(5), &mut shutdown, &mut handler);

        assert_eq!(
            handler.seen,
            vec![
                (1, PollerEvent::READ),
                (2, PollerEvent::WRITE | PollerEvent::HUP)
            ]
        );
        assert_eq!(handler.ticks, 3);
    }
}
