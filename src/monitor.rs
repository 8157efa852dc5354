use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherSpec;
use crate::error::{Result, VilainError};
use crate::models::{OffenseEvent, OffenseSender};

/// Read cursor over an append-only log file.
///
/// Starts at the end of the file, so only lines written after the daemon
/// started are seen. The cursor goes back to 0 when the file is rotated
/// (new inode) or truncated (size below the cursor).
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    inode: u64,
    mtime: Option<SystemTime>,
}

impl LogTail {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path)?;
        Ok(Self {
            path,
            offset: meta.len(),
            inode: meta.ino(),
            mtime: meta.modified().ok(),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Lines appended since the last poll.
    ///
    /// A line still being written is returned as it stands; the rest of it
    /// shows up as a separate line on the next poll.
    pub fn poll(&mut self) -> io::Result<Vec<String>> {
        let mut file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let size = meta.len();
        let inode = meta.ino();
        let mtime = meta.modified().ok();

        let rotated = inode != self.inode || size < self.offset;
        if rotated {
            info!(
                "The file {} has rotated. We start from position 0",
                self.path.display()
            );
            self.offset = 0;
            self.inode = inode;
        }

        if !rotated && mtime <= self.mtime && size <= self.offset {
            return Ok(Vec::new());
        }
        debug!("{} has been modified", self.path.display());
        self.mtime = mtime;

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf)?;
        self.offset += read as u64;

        let mut lines = Vec::new();
        for raw in buf.split(|b| *b == b'\n') {
            match std::str::from_utf8(raw) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                }
                Err(e) => warn!(
                    "Skipping undecodable line in {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(lines)
    }
}

/// Tails one log file and queues an offense for every matching line
pub struct LogWatcher {
    spec: WatcherSpec,
    sleep_time: Duration,
    ignore: Arc<BTreeSet<String>>,
}

impl LogWatcher {
    pub fn new(spec: WatcherSpec, sleep_time: Duration, ignore: Arc<BTreeSet<String>>) -> Self {
        Self {
            spec,
            sleep_time,
            ignore,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Address captured by the rule, when the line matches from its start
    pub fn match_line<'a>(&self, line: &'a str) -> Option<&'a str> {
        let captures = self.spec.pattern.captures(line)?;
        if captures.get(0)?.start() != 0 {
            return None;
        }
        Some(captures.get(1)?.as_str())
    }

    /// Offense for `line`, unless it doesn't match or the address is ignored
    pub fn offense(&self, line: &str) -> Option<OffenseEvent> {
        let address = self.match_line(line)?;
        if self.ignore.contains(address) {
            info!("line match {}. But IP in ignore list", address);
            return None;
        }

        info!("line match {} the {} rule", address, self.spec.name);
        Some(OffenseEvent {
            address: address.to_string(),
            reason: self.spec.name.clone(),
            max_tries: self.spec.max_tries,
        })
    }

    /// Poll the file every `sleep_time` until `cancel` fires.
    ///
    /// Returns right away when the file is missing at start. Any I/O error
    /// other than the file briefly vanishing during rotation ends this
    /// watcher only.
    pub async fn run(self, queue: OffenseSender, cancel: CancellationToken) -> Result<()> {
        let path = self.spec.log_path.clone();
        let mut tail = match LogTail::open(&path) {
            Ok(tail) => tail,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} doesn't exist", path.display());
                return Ok(());
            }
            Err(source) => return Err(VilainError::Io { path, source }),
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.sleep_time) => {}
            }

            let lines = match tail.poll() {
                Ok(lines) => lines,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} is missing, waiting for it to come back", path.display());
                    continue;
                }
                Err(source) => {
                    error!("Can't read {}: {}", path.display(), source);
                    return Err(VilainError::Io { path, source });
                }
            };

            for line in lines {
                debug!("line:{}", line);
                if let Some(event) = self.offense(&line) {
                    if queue.send(event).is_err() {
                        debug!("Offense queue closed, stopping {}", self.spec.name);
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const FAILED_LOGIN: &str = r"Failed login from (\d+\.\d+\.\d+\.\d+)";

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn watcher(path: &Path, ignore: &[&str]) -> LogWatcher {
        let spec = WatcherSpec::new("login", path, FAILED_LOGIN, 3).unwrap();
        let ignore = ignore.iter().map(|s| s.to_string()).collect();
        LogWatcher::new(spec, Duration::from_millis(100), Arc::new(ignore))
    }

    #[test]
    fn test_tail_starts_at_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "old line\n");

        let mut tail = LogTail::open(&path).unwrap();
        assert_eq!(tail.offset(), 9);
        assert!(tail.poll().unwrap().is_empty());

        append(&path, "new line 1\nnew line 2\n");
        assert_eq!(tail.poll().unwrap(), vec!["new line 1", "new line 2"]);
        assert!(tail.poll().unwrap().is_empty());
    }

    #[test]
    fn test_tail_partial_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");
        let mut tail = LogTail::open(&path).unwrap();

        // a half-written line is taken as-is, its tail comes as its own line
        append(&path, "Failed login from 10.0");
        assert_eq!(tail.poll().unwrap(), vec!["Failed login from 10.0"]);
        append(&path, ".0.5\n");
        assert_eq!(tail.poll().unwrap(), vec![".0.5"]);
    }

    #[test]
    fn test_tail_rotation_new_inode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "Failed login from 10.0.0.1\nFailed login from 10.0.0.2\n");
        let mut tail = LogTail::open(&path).unwrap();

        // replace with a fresh empty file
        let fresh = dir.path().join("auth.log.new");
        append(&fresh, "");
        std::fs::rename(&fresh, &path).unwrap();
        assert!(tail.poll().unwrap().is_empty());
        assert_eq!(tail.offset(), 0);

        append(&path, "Failed login from 10.0.0.3\n");
        assert_eq!(tail.poll().unwrap(), vec!["Failed login from 10.0.0.3"]);
    }

    #[test]
    fn test_tail_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "a fairly long first line\n");
        let mut tail = LogTail::open(&path).unwrap();

        std::fs::write(&path, "short\n").unwrap();
        assert_eq!(tail.poll().unwrap(), vec!["short"]);
    }

    #[test]
    fn test_tail_skips_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");
        let mut tail = LogTail::open(&path).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"bad \xff\xfe line\nFailed login from 10.0.0.5\n").unwrap();
        assert_eq!(tail.poll().unwrap(), vec!["Failed login from 10.0.0.5"]);
    }

    #[test]
    fn test_tail_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");
        let mut tail = LogTail::open(&path).unwrap();

        std::fs::remove_file(&path).unwrap();
        let err = tail.poll().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_match_line_anchored() {
        let w = watcher(Path::new("/var/log/authlog"), &[]);
        assert_eq!(w.match_line("Failed login from 10.0.0.5"), Some("10.0.0.5"));
        assert_eq!(
            w.match_line("Failed login from 10.0.0.5 port 22"),
            Some("10.0.0.5")
        );
        assert_eq!(w.match_line("sshd: Failed login from 10.0.0.5"), None);
        assert_eq!(w.match_line("Accepted login from 10.0.0.5"), None);
    }

    #[test]
    fn test_offense_event() {
        let w = watcher(Path::new("/var/log/authlog"), &[]);
        let event = w.offense("Failed login from 10.0.0.5").unwrap();
        assert_eq!(event.address, "10.0.0.5");
        assert_eq!(event.reason, "login");
        assert_eq!(event.max_tries, 3);
    }

    #[test]
    fn test_ignored_address_never_queued() {
        let w = watcher(Path::new("/var/log/authlog"), &["127.0.0.1"]);
        for _ in 0..10 {
            assert!(w.offense("Failed login from 127.0.0.1").is_none());
        }
        assert!(w.offense("Failed login from 127.0.0.2").is_some());
    }

    #[tokio::test]
    async fn test_run_missing_file_returns() {
        let dir = TempDir::new().unwrap();
        let w = watcher(&dir.path().join("nope.log"), &[]);
        let (tx, mut rx) = crate::models::offense_queue();

        w.run(tx, CancellationToken::new()).await.unwrap();
        // the watcher dropped its sender
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_queues_matches_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "Failed login from 10.9.9.9\n");

        let w = watcher(&path, &["127.0.0.1"]);
        let (tx, mut rx) = crate::models::offense_queue();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(w.run(tx, cancel.clone()));

        // the watcher records the end of file before its first sleep
        tokio::time::sleep(Duration::from_millis(20)).await;
        append(
            &path,
            "Failed login from 10.0.0.1\nnoise\nFailed login from 127.0.0.1\nFailed login from 10.0.0.2\n",
        );

        assert_eq!(rx.recv().await.unwrap().address, "10.0.0.1");
        assert_eq!(rx.recv().await.unwrap().address, "10.0.0.2");

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
