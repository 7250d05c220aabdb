pub use misc::{is_nonblocking, parse_bool, set_fdtable_size, set_socket_blocking};
pub use worker_pool::{PoolHandler, WorkerPool, WorkerPoolConfig};

mod misc;
mod worker_pool;
