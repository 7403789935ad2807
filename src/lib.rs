// Library interface for the relay node
// Per-connection reader/writer supervision, outbound queueing and duplicate suppression

use std::sync::atomic::{AtomicBool, Ordering};

static QUIET: AtomicBool = AtomicBool::new(false);

/// Toggle routine connection lifecycle logging. Errors, warnings and
/// disconnect diagnostics still print.
pub fn set_quiet_logging(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

#[doc(hidden)]
pub fn routine_logging_enabled() -> bool {
    !QUIET.load(Ordering::Relaxed)
}

macro_rules! relay_log {
    ($($arg:tt)*) => {
        if $crate::routine_logging_enabled() {
            println!($($arg)*);
        }
    };
}

pub mod config;
pub mod metrics;
pub mod dedup;
pub mod outbound;
pub mod disconnect;
pub mod socket;
pub mod connection;
pub mod echo;

pub use connection::{Connection, ConnectionCore, ConnectionOptions, Link, NetProcess};
pub use dedup::{fingerprint, DedupCache, Fingerprint, SeenCache};
pub use disconnect::{Flag, FlagSnapshot, WorkerSide};
pub use echo::EchoProcess;
pub use metrics::RelayMetrics;
pub use outbound::{Message, Priority};
pub use socket::RelaySocket;
