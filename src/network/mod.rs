//! Connection state and the non-blocking I/O wrapper.
//!
//! # Components
//!
//! - `Connection`: per-socket buffers, poll interest and protocol payload
//! - `ConnectionFactory`: creates and destroys connections, sole owner of
//!   the fd close
//! - `Request` / `Response`: buffered non-blocking read and write facades
//!   borrowed for one stage invocation

pub use connection::{
    Connection, ConnectionFactory, ConnectionId, FdStream, PlainConnectionFactory, Transport,
};
pub use wrapper::{IoStatus, Request, Response, DEFAULT_RESPONSE_BUFFER_SIZE};

mod connection;
#[cfg(test)]
pub(crate) mod mock;
mod wrapper;
