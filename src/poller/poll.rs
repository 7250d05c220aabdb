use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{PollerEvent, Selector, Token};
use crate::utils::set_socket_blocking;

/// Portable `poll(2)` backend.
///
/// Registrations live in user space and the pollfd array is rebuilt for
/// every wait. A self-pipe wakes a blocked wait whenever the registration
/// table changes, so new fds are picked up without waiting for the timeout.
pub struct PollSelector {
    registrations: Mutex<HashMap<RawFd, (Token, PollerEvent)>>,
    scratch: Mutex<Scratch>,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

#[derive(Default)]
struct Scratch {
    pollfds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    // where the next capped scan starts, so ready fds past the cap get served
    next_start: usize,
}

impl PollSelector {
    pub fn new() -> io::Result<PollSelector> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors are fresh and owned from here on.
        let (wake_rx, wake_tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [wake_rx.as_raw_fd(), wake_tx.as_raw_fd()] {
            set_socket_blocking(fd, false)?;
            // SAFETY: only sets the close-on-exec descriptor flag.
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(PollSelector {
            registrations: Mutex::new(HashMap::new()),
            scratch: Mutex::new(Scratch::default()),
            wake_rx,
            wake_tx,
        })
    }

    fn wake(&self) {
        let byte = 1u8;
        // a full pipe already guarantees a wakeup
        let _ = unsafe {
            libc::write(
                self.wake_tx.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
    }

    fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

pub fn to_poll(evt: PollerEvent) -> libc::c_short {
    let mut res = 0;
    if evt.contains(PollerEvent::READ) {
        res |= libc::POLLIN;
    }
    if evt.contains(PollerEvent::WRITE) {
        res |= libc::POLLOUT;
    }
    if evt.contains(PollerEvent::ERROR) {
        res |= libc::POLLERR;
    }
    if evt.contains(PollerEvent::HUP) {
        res |= libc::POLLHUP;
    }
    res
}

/// POLLNVAL is folded into ERROR, POLLPRI is not represented.
pub fn from_poll(revents: libc::c_short) -> PollerEvent {
    let mut evt = PollerEvent::NONE;
    if revents & libc::POLLIN != 0 {
        evt |= PollerEvent::READ;
    }
    if revents & libc::POLLOUT != 0 {
        evt |= PollerEvent::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        evt |= PollerEvent::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        evt |= PollerEvent::HUP;
    }
    evt
}

impl Selector for PollSelector {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()> {
        {
            let mut registrations = self.registrations.lock();
            if registrations.contains_key(&fd) {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            registrations.insert(fd, (token, events));
        }
        self.wake();
        Ok(())
    }

    fn reregister(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()> {
        {
            let mut registrations = self.registrations.lock();
            match registrations.get_mut(&fd) {
                Some(entry) => *entry = (token, events),
                None => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
            }
        }
        self.wake();
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        if self.registrations.lock().remove(&fd).is_none() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.wake();
        Ok(())
    }

    fn select(
        &self,
        events: &mut Vec<(Token, PollerEvent)>,
        max_events: usize,
        timeout: Duration,
    ) -> io::Result<()> {
        let mut scratch = self.scratch.lock();
        let Scratch {
            pollfds,
            tokens,
            next_start,
        } = &mut *scratch;
        pollfds.clear();
        tokens.clear();
        pollfds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for (fd, (token, evt)) in self.registrations.lock().iter() {
            pollfds.push(libc::pollfd {
                fd: *fd,
                events: to_poll(*evt),
                revents: 0,
            });
            tokens.push(*token);
        }

        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: `pollfds` is a live, initialized array of the given length.
        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if pollfds[0].revents != 0 {
            trace!("poll woken up by a registration change");
            self.drain_wakeups();
        }
        let watched = tokens.len();
        if watched == 0 {
            return Ok(());
        }
        let start = *next_start % watched;
        for offset in 0..watched {
            let index = (start + offset) % watched;
            let revents = pollfds[index + 1].revents;
            if revents == 0 {
                continue;
            }
            if events.len() >= max_events {
                *next_start = index;
                return Ok(());
            }
            events.push((tokens[index], from_poll(revents)));
        }
        *next_start = start;
        Ok(())
    }
}
