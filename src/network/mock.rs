//! In-memory transport for stage and wrapper tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

// far above anything the tests open for real
static NEXT_FAKE_FD: AtomicI32 = AtomicI32::new(100_000);

#[derive(Default)]
struct MockState {
    incoming: VecDeque<Vec<u8>>,
    peer_closed: bool,
    written: Vec<u8>,
    // per write call cap, 0 means would block, empty means unlimited
    write_caps: VecDeque<usize>,
}

/// Cloning shares the state, so a test keeps a handle after moving the
/// transport into a connection.
#[derive(Clone)]
pub(crate) struct MockTransport {
    fd: RawFd,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        MockTransport {
            fd: NEXT_FAKE_FD.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }
}

impl MockTransport {
    /// Each call is delivered by a separate read.
    pub(crate) fn push_input(&self, data: &[u8]) {
        self.state.lock().incoming.push_back(data.to_vec());
    }

    pub(crate) fn has_input(&self) -> bool {
        !self.state.lock().incoming.is_empty()
    }

    pub(crate) fn close_input(&self) {
        self.state.lock().peer_closed = true;
    }

    pub(crate) fn choke(&self, caps: impl IntoIterator<Item = usize>) {
        self.state.lock().write_caps.extend(caps);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub(crate) fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().written)
    }
}

impl AsRawFd for MockTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let Some(chunk) = state.incoming.front_mut() else {
            if state.peer_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            state.incoming.pop_front();
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let cap = state.write_caps.pop_front().unwrap_or(usize::MAX);
        if cap == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = cap.min(buf.len());
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
