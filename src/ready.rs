//! Readiness bookkeeping for one event source.
//!
//! The poller is edge-triggered, so an event bit must stay set until the
//! corresponding operation returns WouldBlock. Each source carries the
//! interest we declared and the events observed so far; a session makes
//! progress as long as the intersection is non-empty.

use std::{
    fmt,
    ops::{BitAnd, BitOr, BitOrAssign},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready(pub u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    pub const HUP: Ready = Ready(0b1000);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Ready::READABLE.0 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Ready::WRITABLE.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Ready::ERROR.0 != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & Ready::HUP.0 != 0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }
}

impl BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;
    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Ready {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready.insert(Ready::READABLE);
        }
        if event.is_writable() {
            ready.insert(Ready::WRITABLE);
        }
        if event.is_error() {
            ready.insert(Ready::ERROR);
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready.insert(Ready::HUP);
        }
        ready
    }
}

impl fmt::Display for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.is_readable() { "R" } else { "-" },
            if self.is_writable() { "W" } else { "-" },
            if self.is_error() { "E" } else { "-" },
            if self.is_hup() { "H" } else { "-" },
        )
    }
}

/// Interest/event pair for one descriptor, in the style of a session's
/// frontend or backend readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// the directions we want to make progress on
    pub interest: Ready,
    /// the directions the poller reported since the last WouldBlock
    pub event: Ready,
}

impl Readiness {
    pub fn new() -> Readiness {
        Readiness {
            interest: Ready::EMPTY,
            event: Ready::EMPTY,
        }
    }

    /// the intersection that allows progress right now
    pub fn filter(&self) -> Ready {
        self.interest & self.event
    }
}

impl Default for Readiness {
    fn default() -> Readiness {
        Readiness::new()
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}", self.interest, self.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_is_intersection() {
        let mut readiness = Readiness::new();
        readiness.interest = Ready::READABLE | Ready::HUP;
        readiness.event = Ready::READABLE | Ready::WRITABLE;
        assert_eq!(readiness.filter(), Ready::READABLE);
        readiness.event.remove(Ready::READABLE);
        assert!(readiness.filter().is_empty());
    }
}
