//! Disconnect flag word shared by the reader, the writer and the owner.

use anyhow::{bail, Result};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Started = 1,
    PrintAndClose = 2,
    FromWriteThread = 4,
    FromReadThread = 8,
    Complete = 16,
}

impl Flag {
    const fn bit(self) -> u8 {
        self as u8
    }
}

/// Lock-free set of [`Flag`] bits.
#[derive(Debug, Default)]
pub struct DisconnectFlags {
    bits: AtomicU8,
}

impl DisconnectFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `flag` and reports whether it was already set.
    pub fn test_and_set(&self, flag: Flag) -> bool {
        self.bits.fetch_or(flag.bit(), Ordering::SeqCst) & flag.bit() != 0
    }

    pub fn set(&self, flag: Flag) {
        self.bits.fetch_or(flag.bit(), Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot(self.bits.load(Ordering::SeqCst))
    }
}

/// Point-in-time copy of the flag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FlagSnapshot(u8);

impl FlagSnapshot {
    #[cfg(test)]
    fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[cfg(test)]
    fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FlagSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Flag::Started, "Started"),
            (Flag::PrintAndClose, "PrintAndClose"),
            (Flag::FromWriteThread, "FromWriteThread"),
            (Flag::FromReadThread, "FromReadThread"),
            (Flag::Complete, "Complete"),
        ];
        f.debug_set()
            .entries(names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, n)| n))
            .finish()
    }
}

/// The worker thread still owed a join at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSide {
    Reader,
    Writer,
}

/// Decide which worker teardown must join. The side that ran the disconnect
/// sequence joined the other one, so it is the one left.
pub fn teardown_side(flags: FlagSnapshot) -> Result<WorkerSide> {
    if !flags.contains(Flag::Complete) {
        bail!("connection dropped before disconnect completed (flags {:?})", flags);
    }
    match (flags.contains(Flag::FromReadThread), flags.contains(Flag::FromWriteThread)) {
        (true, false) => Ok(WorkerSide::Reader),
        (false, true) => Ok(WorkerSide::Writer),
        (false, false) => bail!("disconnect complete but not from either thread (flags {:?})", flags),
        (true, true) => bail!("disconnect recorded from both threads (flags {:?})", flags),
    }
}
