//! vilain: fail2ban-like intrusion prevention on top of pf tables.
//!
//! Log watchers match new lines against per-rule patterns, an aggregator
//! bans addresses that offend too often and a sweeper unbans them once
//! they have been quiet for the watch window.

pub mod config;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod report;

pub use config::{Settings, WatcherSpec};
pub use engine::Vilain;
pub use error::{Result, VilainError};
pub use firewall::{BlockTable, CommandStatus, MemoryTable, Pfctl};

/// Version reported at startup and by `--version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// True when running with root privileges
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}
