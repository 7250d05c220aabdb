use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::network::Connection;

/// Scheduling state of a connection.
///
/// Whoever moves a slot out of `Polling` owns the fd's poller registration
/// and is responsible for removing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// watched by the poller, no task in flight
    Polling = 0,
    /// owned by the poller callback or a stage task
    Scheduled = 1,
    Closing = 2,
}

impl SlotState {
    fn from_u8(value: u8) -> SlotState {
        match value {
            0 => SlotState::Polling,
            1 => SlotState::Scheduled,
            _ => SlotState::Closing,
        }
    }
}

/// Connection table entry.
#[derive(Debug)]
pub(crate) struct ConnectionSlot {
    pub(crate) fd: RawFd,
    state: AtomicU8,
    // only ever locked by the current owner of the slot, never contended
    pub(crate) conn: Mutex<Option<Connection>>,
}

impl ConnectionSlot {
    /// New slots start `Scheduled`, registration arms them.
    pub(crate) fn new(conn: Connection) -> Self {
        ConnectionSlot {
            fd: conn.fd(),
            state: AtomicU8::new(SlotState::Scheduled as u8),
            conn: Mutex::new(Some(conn)),
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the slot closing, returning the previous state.
    pub(crate) fn begin_close(&self) -> SlotState {
        SlotState::from_u8(self.state.swap(SlotState::Closing as u8, Ordering::AcqRel))
    }
}
