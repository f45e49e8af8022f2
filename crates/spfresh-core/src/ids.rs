//! Identifier newtypes (§3 DATA MODEL).
//!
//! `Vid` is never reused while the process runs. `Hid` is a `Vid` that also
//! happens to live in the head index. `Pid` equals the `Vid` of its head
//! until a `Split` hands its cluster to new heads.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Vid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vid:{}", self.0)
    }
}

impl fmt::Display for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hid:{}", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

impl From<Hid> for Vid {
    fn from(h: Hid) -> Self {
        Vid(h.0)
    }
}

impl From<Vid> for Hid {
    fn from(v: Vid) -> Self {
        Hid(v.0)
    }
}

impl From<Hid> for Pid {
    fn from(h: Hid) -> Self {
        Pid(h.0)
    }
}

/// A version byte. Increments on `Reassign`, wraps modulo 256 (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version(pub u8);

impl Version {
    #[must_use]
    pub fn bump(self) -> Self {
        Version(self.0.wrapping_add(1))
    }
}
