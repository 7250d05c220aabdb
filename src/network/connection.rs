use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::debug;

use crate::poller::PollerEvent;
use crate::AppResult;

/// Stable handle of a connection, doubles as its poller token.
/// Allocated from a monotonic counter and never reused.
pub type ConnectionId = u64;

const INIT_BUFFER_SIZE: usize = 4 * 1024;

/// Byte stream a connection reads from and writes to.
///
/// Reads and writes must not block: an fd is expected to be in
/// non-blocking mode and report `WouldBlock` when it is not ready.
pub trait Transport: Read + Write + AsRawFd + Send + 'static {}

impl<T: Read + Write + AsRawFd + Send + 'static> Transport for T {}

/// A raw descriptor used as a transport, for sockets that did not come
/// from the standard library.
#[derive(Debug)]
pub struct FdStream {
    fd: OwnedFd,
}

impl From<OwnedFd> for FdStream {
    fn from(fd: OwnedFd) -> Self {
        FdStream { fd }
    }
}

impl AsRawFd for FdStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for reads of `buf.len()` bytes.
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Per-socket state routed through the pipeline stages.
///
/// The connection owns its transport, the fd is closed when the connection
/// is dropped. Only the holder of the pipeline's scheduling right touches
/// the buffers, so they carry no lock of their own.
pub struct Connection {
    id: ConnectionId,
    fd: RawFd,
    transport: Box<dyn Transport>,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    interest: PollerEvent,
    readiness: PollerEvent,
    timeout: Option<Duration>,
    last_active: Instant,
    payload: Option<Box<dyn Any + Send>>,
}

impl Connection {
    pub fn new(id: ConnectionId, transport: Box<dyn Transport>) -> Connection {
        Connection {
            id,
            fd: transport.as_raw_fd(),
            transport,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            interest: PollerEvent::READ,
            readiness: PollerEvent::NONE,
            timeout: None,
            last_active: Instant::now(),
            payload: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// One write of the staged output, the caller advances `write_buf`.
    pub(crate) fn write_staged(&mut self) -> io::Result<usize> {
        self.transport.write(&self.write_buf[..])
    }

    /// Mask used the next time poll is re-armed.
    pub fn interest(&self) -> PollerEvent {
        self.interest
    }

    pub fn set_interest(&mut self, interest: PollerEvent) {
        self.interest = interest;
    }

    pub fn want_read(&mut self) {
        self.interest = PollerEvent::READ;
    }

    /// Waits for the socket to drain pending output before reading again.
    pub fn want_write(&mut self) {
        self.interest = PollerEvent::WRITE;
    }

    /// Mask of the last readiness report that scheduled this connection.
    pub fn readiness(&self) -> PollerEvent {
        self.readiness
    }

    pub(crate) fn set_readiness(&mut self, readiness: PollerEvent) {
        self.readiness = readiness;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_duration_since(self.last_active) >= timeout,
            None => false,
        }
    }

    /// Bytes staged for writing that have not reached the socket yet.
    pub fn pending_output(&self) -> usize {
        self.write_buf.len()
    }

    pub fn set_payload<T: Any + Send>(&mut self, payload: T) {
        self.payload = Some(Box::new(payload));
    }

    pub fn payload_ref<T: Any + Send>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }

    pub fn payload_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.payload.as_mut()?.downcast_mut::<T>()
    }

    /// Moves the payload out so it can be used alongside a borrow of the
    /// connection. A payload of another type stays in place.
    pub fn take_payload<T: Any + Send>(&mut self) -> Option<Box<T>> {
        match self.payload.take()?.downcast::<T>() {
            Ok(payload) => Some(payload),
            Err(other) => {
                self.payload = Some(other);
                None
            }
        }
    }

    pub fn put_payload<T: Any + Send>(&mut self, payload: Box<T>) {
        self.payload = Some(payload);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("read_buf", &self.read_buf.len())
            .field("write_buf", &self.write_buf.len())
            .field("interest", &self.interest)
            .field("readiness", &self.readiness)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Creates protocol state for newly known sockets and releases it once the
/// pipeline is done with a connection.
///
/// `destroy_connection` is the only place a connection's fd gets closed.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn create_connection(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
    ) -> AppResult<Connection>;

    fn destroy_connection(&self, conn: Connection) {
        debug!("destroy connection {} fd {}", conn.id(), conn.fd());
    }
}

/// Factory producing bare connections with no protocol state.
#[derive(Debug, Default, Clone)]
pub struct PlainConnectionFactory {
    pub timeout: Option<Duration>,
}

impl ConnectionFactory for PlainConnectionFactory {
    fn create_connection(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
    ) -> AppResult<Connection> {
        let mut conn = Connection::new(id, transport);
        conn.set_timeout(self.timeout);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::MockTransport;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_payload_roundtrip_keeps_foreign_type() {
        let mut conn = Connection::new(1, Box::new(MockTransport::default()));
        conn.set_payload(41u32);
        *conn.payload_mut::<u32>().unwrap() += 1;
        assert_eq!(conn.payload_ref::<u32>(), Some(&42));

        assert!(conn.take_payload::<String>().is_none());
        let payload = conn.take_payload::<u32>().unwrap();
        assert_eq!(*payload, 42);
        assert!(conn.payload_ref::<u32>().is_none());
        conn.put_payload(payload);
        assert_eq!(conn.payload_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_idle_detection() {
        let mut conn = Connection::new(1, Box::new(MockTransport::default()));
        let later = Instant::now() + Duration::from_secs(10);
        assert!(!conn.is_idle(later));
        conn.set_timeout(Some(Duration::from_secs(5)));
        assert!(conn.is_idle(later));
        assert!(!conn.is_idle(conn.last_active()));
    }

    #[test]
    fn test_fd_stream_reads_and_writes() -> io::Result<()> {
        let (left, right) = UnixStream::pair()?;
        let mut left = FdStream::from(OwnedFd::from(left));
        let mut right = FdStream::from(OwnedFd::from(right));
        left.write_all(b"hello")?;
        let mut buf = [0u8; 8];
        let n = right.read(&mut buf)?;
        assert_eq!(&buf[..n], b"hello");
        Ok(())
    }
}
