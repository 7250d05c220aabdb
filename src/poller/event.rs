use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Opaque value handed back with every readiness report for an fd.
pub type Token = u64;

/// Logical readiness mask, independent of the backend's native bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PollerEvent(u8);

impl PollerEvent {
    pub const NONE: PollerEvent = PollerEvent(0);
    pub const READ: PollerEvent = PollerEvent(1);
    pub const WRITE: PollerEvent = PollerEvent(2);
    pub const ERROR: PollerEvent = PollerEvent(4);
    pub const HUP: PollerEvent = PollerEvent(8);
    pub const ALL: PollerEvent = PollerEvent(15);

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits_truncate(bits: u8) -> PollerEvent {
        PollerEvent(bits & Self::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: PollerEvent) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: PollerEvent) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: PollerEvent) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PollerEvent) {
        self.0 &= !other.0;
    }

    pub const fn is_readable(self) -> bool {
        self.intersects(Self::READ)
    }

    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITE)
    }

    /// ERROR or HUP
    pub const fn is_closed(self) -> bool {
        self.intersects(PollerEvent(Self::ERROR.0 | Self::HUP.0))
    }
}

impl BitOr for PollerEvent {
    type Output = PollerEvent;
    fn bitor(self, rhs: PollerEvent) -> PollerEvent {
        PollerEvent(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollerEvent {
    fn bitor_assign(&mut self, rhs: PollerEvent) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PollerEvent {
    type Output = PollerEvent;
    fn bitand(self, rhs: PollerEvent) -> PollerEvent {
        PollerEvent(self.0 & rhs.0)
    }
}

impl fmt::Debug for PollerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::ERROR, "ERROR"),
            (Self::HUP, "HUP"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
