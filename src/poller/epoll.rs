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

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use parking_lot::Mutex;

use super::{PollerEvent, Selector, Token};

/// Level-triggered epoll.
pub struct EpollSelector {
    epoll_fd: OwnedFd,
    // only the poller thread waits, the lock is never contended
    ready: Mutex<Vec<libc::epoll_event>>,
}

impl EpollSelector {
    pub fn new() -> io::Result<EpollSelector> {
        // SAFETY: plain syscall, the returned fd is owned right below.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollSelector {
            // SAFETY: `fd` is a fresh descriptor nobody else owns.
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            ready: Mutex::new(Vec::new()),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()> {
        let mut epoll_evt = libc::epoll_event {
            events: to_epoll(events),
            u64: token,
        };
        // SAFETY: `epoll_evt` outlives the call; DEL ignores it on current kernels.
        let res = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut epoll_evt) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// EPOLLPRI and EPOLLRDHUP have no logical counterpart and are never requested.
pub fn to_epoll(evt: PollerEvent) -> u32 {
    let mut res = 0;
    if evt.contains(PollerEvent::READ) {
        res |= libc::EPOLLIN as u32;
    }
    if evt.contains(PollerEvent::WRITE) {
        res |= libc::EPOLLOUT as u32;
    }
    if evt.contains(PollerEvent::ERROR) {
        res |= libc::EPOLLERR as u32;
    }
    if evt.contains(PollerEvent::HUP) {
        res |= libc::EPOLLHUP as u32;
    }
    res
}

pub fn from_epoll(events: u32) -> PollerEvent {
    let mut evt = PollerEvent::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        evt |= PollerEvent::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        evt |= PollerEvent::WRITE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        evt |= PollerEvent::ERROR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        evt |= PollerEvent::HUP;
    }
    evt
}

impl Selector for EpollSelector {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    fn reregister(&self, fd: RawFd, token: Token, events: PollerEvent) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, PollerEvent::NONE)
    }

    fn select(
        &self,
        events: &mut Vec<(Token, PollerEvent)>,
        max_events: usize,
        timeout: Duration,
    ) -> io::Result<()> {
        let mut ready = self.ready.lock();
        ready.clear();
        ready.reserve(max_events);
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: the buffer has room for `max_events` entries.
        let nfds = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                ready.as_mut_ptr(),
                max_events as libc::c_int,
                timeout_ms,
            )
        };
        if nfds < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        // SAFETY: the kernel initialized the first `nfds` entries.
        unsafe { ready.set_len(nfds as usize) };

        for epoll_evt in ready.iter() {
            let token = epoll_evt.u64;
            let bits = epoll_evt.events;
            events.push((token, from_epoll(bits)));
        }
        Ok(())
    }
}
