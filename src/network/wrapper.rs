//! Non-blocking, connection scoped I/O facades used by stage code.
//!
//! A [`Request`] or [`Response`] borrows the connection for a single stage
//! invocation. Neither ever waits for the socket: when the OS is not ready
//! the call reports [`IoStatus::WouldBlock`] and the stage is expected to
//! re-arm poll and return.
//!
//! The facades hold no pipeline handle. Re-arming goes through the stage's
//! return value: `want_read`/`want_write` on the connection pick the interest
//! and `StageStatus::Rearm` hands the connection back to the poller.

use std::io::{self, ErrorKind, Read};

use bytes::Buf;
use tracing::trace;

use super::Connection;
use crate::{AppError, AppResult};

pub const DEFAULT_RESPONSE_BUFFER_SIZE: usize = 4096;

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Number of bytes moved. A read of 0 means the peer closed.
    Complete(usize),
    WouldBlock,
}

pub struct Request<'a> {
    conn: &'a mut Connection,
}

impl<'a> Request<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Request { conn }
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> AppResult<IoStatus> {
        loop {
            match self.conn.transport_mut().read(buf) {
                Ok(n) => {
                    if n > 0 {
                        self.conn.touch();
                    }
                    return Ok(IoStatus::Complete(n));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Appends up to `max_size` bytes to the connection's read buffer.
    pub fn read_to_buffer(&mut self, max_size: usize) -> AppResult<IoStatus> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let want = max_size.min(READ_CHUNK_SIZE);
        let status = self.read_data(&mut chunk[..want])?;
        if let IoStatus::Complete(n) = status {
            self.conn.read_buf.extend_from_slice(&chunk[..n]);
        }
        Ok(status)
    }
}

/// Buffered writer over a connection.
///
/// Staged bytes live in the connection's write buffer, so a remainder left
/// by a partial write survives this `Response` and is flushed by a later
/// stage invocation once the socket is writable again.
pub struct Response<'a> {
    conn: &'a mut Connection,
    buffer_size: usize,
    buffered: bool,
    active: bool,
}

impl<'a> Response<'a> {
    pub fn new(conn: &'a mut Connection, buffer_size: usize) -> Self {
        Response {
            conn,
            buffer_size: buffer_size.max(1),
            buffered: true,
            active: true,
        }
    }

    /// Disabled buffering writes through on every call, still behind any
    /// bytes that are already staged.
    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Marks the response finished. The fd stays open.
    pub fn close(&mut self) {
        self.active = false;
    }

    pub fn connection(&mut self) -> &mut Connection {
        self.conn
    }

    pub fn pending(&self) -> usize {
        self.conn.write_buf.len()
    }

    /// Accepts all of `data`; a full staging buffer is flushed on the way.
    /// Bytes the socket refused stay staged.
    pub fn write_data(&mut self, data: &[u8]) -> AppResult<usize> {
        if !self.active {
            return Err(AppError::ResponseClosed);
        }
        self.conn.write_buf.extend_from_slice(data);
        if !self.buffered || self.conn.write_buf.len() >= self.buffer_size {
            self.flush_data()?;
        }
        Ok(data.len())
    }

    /// `Complete(n)` once nothing is left staged, `WouldBlock` if the socket
    /// took only part of it.
    pub fn flush_data(&mut self) -> AppResult<IoStatus> {
        if !self.active {
            return Err(AppError::ResponseClosed);
        }
        let mut flushed = 0;
        while !self.conn.write_buf.is_empty() {
            match self.conn.write_staged() {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::WriteZero, "socket accepted no bytes").into());
                }
                Ok(n) => {
                    self.conn.write_buf.advance(n);
                    flushed += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    trace!(
                        "connection {} flushed {flushed} bytes, {} left",
                        self.conn.id(),
                        self.conn.write_buf.len()
                    );
                    if flushed > 0 {
                        self.conn.touch();
                    }
                    return Ok(IoStatus::WouldBlock);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if flushed > 0 {
            self.conn.touch();
        }
        Ok(IoStatus::Complete(flushed))
    }
}
