//! Block table access
//!
//! The engine only talks to the packet filter through [`BlockTable`]. The
//! production implementation shells out to `pfctl`; [`MemoryTable`] keeps
//! everything in process for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Outcome of one block-table command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// The tool ran and exited with this code
    Exited(i32),
    /// The tool was killed by a signal
    Signaled,
    /// The tool could not be started
    Failed(String),
}

impl CommandStatus {
    /// Exit code as written in the daemon log; -1 when there is none
    pub fn code(&self) -> i32 {
        match self {
            CommandStatus::Exited(code) => *code,
            _ => -1,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, CommandStatus::Exited(0))
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<std::io::Result<std::process::ExitStatus>> for CommandStatus {
    fn from(res: std::io::Result<std::process::ExitStatus>) -> Self {
        match res {
            Ok(status) => match status.code() {
                Some(code) => CommandStatus::Exited(code),
                None => CommandStatus::Signaled,
            },
            Err(e) => CommandStatus::Failed(e.to_string()),
        }
    }
}

/// Named set of blocked addresses maintained by the packet filter.
///
/// `add` and `delete` are idempotent on the packet filter side; callers log
/// the returned status and carry on.
#[async_trait]
pub trait BlockTable: Send + Sync {
    /// Addresses currently in the table; empty when the table can't be read
    async fn list(&self, table: &str) -> BTreeSet<String>;

    async fn add(&self, table: &str, address: &str) -> CommandStatus;

    async fn delete(&self, table: &str, address: &str) -> CommandStatus;
}

/// `pfctl -t <table> -T show|add|delete`
#[derive(Debug, Clone)]
pub struct Pfctl {
    program: String,
}

impl Pfctl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, table: &str, op: &str, address: &str) -> CommandStatus {
        debug!("{} -t {} -T {} {}", self.program, table, op, address);
        let output = Command::new(&self.program)
            .args(["-t", table, "-T", op, address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(out) => {
                let status = CommandStatus::from(std::io::Result::Ok(out.status));
                if !status.success() {
                    warn!(
                        "{} -t {} -T {} {} failed, return code:{}: {}",
                        self.program,
                        table,
                        op,
                        address,
                        status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    );
                }
                status
            }
            Err(e) => CommandStatus::Failed(e.to_string()),
        }
    }
}

impl Default for Pfctl {
    fn default() -> Self {
        Self::new("pfctl")
    }
}

#[async_trait]
impl BlockTable for Pfctl {
    async fn list(&self, table: &str) -> BTreeSet<String> {
        let output = Command::new(&self.program)
            .args(["-t", table, "-T", "show"])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                parse_show_output(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!(
                    "Failed to run {} -t {} -T show, return code:{}",
                    self.program,
                    table,
                    CommandStatus::from(std::io::Result::Ok(out.status))
                );
                BTreeSet::new()
            }
            Err(e) => {
                warn!("Failed to run {} -t {} -T show: {}", self.program, table, e);
                BTreeSet::new()
            }
        }
    }

    async fn add(&self, table: &str, address: &str) -> CommandStatus {
        self.run(table, "add", address).await
    }

    async fn delete(&self, table: &str, address: &str) -> CommandStatus {
        self.run(table, "delete", address).await
    }
}

/// Split the output of `-T show` into addresses
pub fn parse_show_output(stdout: &str) -> BTreeSet<String> {
    stdout.split_whitespace().map(str::to_string).collect()
}

/// A block-table operation, as recorded by [`MemoryTable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableCall {
    List,
    Add(String),
    Delete(String),
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeSet<String>,
    calls: Vec<TableCall>,
}

/// In-process block table.
///
/// Used by `--dry-run` and by the tests, which inspect the recorded calls.
#[derive(Debug, Default)]
pub struct MemoryTable {
    inner: Mutex<MemoryInner>,
    failing: bool,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that already holds `entries`
    pub fn with_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = Self::new();
        table
            .inner
            .lock()
            .entries
            .extend(entries.into_iter().map(Into::into));
        table
    }

    /// Table whose every command fails, like a missing pfctl
    pub fn failing() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            failing: true,
        }
    }

    pub fn entries(&self) -> BTreeSet<String> {
        self.inner.lock().entries.clone()
    }

    pub fn calls(&self) -> Vec<TableCall> {
        self.inner.lock().calls.clone()
    }

    pub fn adds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TableCall::Add(ip) => Some(ip),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TableCall::Delete(ip) => Some(ip),
                _ => None,
            })
            .collect()
    }

    fn status(&self) -> CommandStatus {
        if self.failing {
            CommandStatus::Failed("table unavailable".to_string())
        } else {
            CommandStatus::Exited(0)
        }
    }
}

#[async_trait]
impl BlockTable for MemoryTable {
    async fn list(&self, _table: &str) -> BTreeSet<String> {
        let mut inner = self.inner.lock();
        inner.calls.push(TableCall::List);
        if self.failing {
            return BTreeSet::new();
        }
        inner.entries.clone()
    }

    async fn add(&self, _table: &str, address: &str) -> CommandStatus {
        let mut inner = self.inner.lock();
        inner.calls.push(TableCall::Add(address.to_string()));
        if !self.failing {
            inner.entries.insert(address.to_string());
        }
        self.status()
    }

    async fn delete(&self, _table: &str, address: &str) -> CommandStatus {
        let mut inner = self.inner.lock();
        inner.calls.push(TableCall::Delete(address.to_string()));
        if !self.failing {
            inner.entries.remove(address);
        }
        self.status()
    }
}
