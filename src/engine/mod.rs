//! Ban engine
//!
//! Log watchers feed a shared queue; a single aggregator counts offenses and
//! bans, a sweeper lifts bans once addresses have been quiet for the watch
//! window.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐
//! │ LogWatcher  │──┐
//! └─────────────┘  │   ┌──────────────┐     ┌───────────────┐     ┌──────────────┐
//! ┌─────────────┐  ├──▶│ OffenseQueue │────▶│ BanAggregator │────▶│  BlockTable  │
//! │ LogWatcher  │──┘   │  (unbounded) │     └───────────────┘     │   (pfctl)    │
//! └─────────────┘      └──────────────┘             │             └──────────────┘
//!                                                   ▼                    ▲
//!                                           ┌───────────────┐            │
//!                                           │ AddressTable  │◀───┐       │
//!                                           └───────────────┘    │       │
//!                                                        ┌───────────────┐
//!                                                        │ ExpirySweeper │
//!                                                        └───────────────┘
//! ```

pub mod aggregator;
pub mod state;
pub mod sweeper;

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::firewall::BlockTable;
use crate::models::offense_queue;
use crate::monitor::LogWatcher;

pub use aggregator::BanAggregator;
pub use state::{AddressTable, SharedAddressTable};
pub use sweeper::ExpirySweeper;

/// The vilain runtime
pub struct Vilain {
    settings: Settings,
    block: Arc<dyn BlockTable>,
    state: SharedAddressTable,
}

impl Vilain {
    pub fn new(settings: Settings, block: Arc<dyn BlockTable>) -> Self {
        Self {
            settings,
            block,
            state: AddressTable::new().shared(),
        }
    }

    /// Handle on the address table, for status reporting and tests
    pub fn state(&self) -> SharedAddressTable {
        self.state.clone()
    }

    /// Track the addresses already in the block table.
    ///
    /// Their offense history is unknown, so each starts at one offense seen
    /// now.
    pub async fn seed(&self) -> usize {
        let banned = self.block.list(&self.settings.table).await;
        for ip in &banned {
            info!("Add existing banned IPs in your pf table: {}", ip);
        }
        self.state.lock().await.seed(banned, Instant::now())
    }

    /// Seed the address table, start every task and run until `cancel`
    pub async fn run(self, cancel: CancellationToken) {
        info!("Start vilain version {}", crate::VERSION);
        self.seed().await;

        let (tx, rx) = offense_queue();
        let ignore = Arc::new(self.settings.ignore.clone());
        let mut tasks = JoinSet::new();

        for spec in &self.settings.watchers {
            info!(
                "Start vilain for {} (logfile {}, maxtries {})",
                spec.name,
                spec.log_path.display(),
                spec.max_tries
            );
            let watcher = LogWatcher::new(spec.clone(), self.settings.sleep_time, ignore.clone());
            let tx = tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let name = watcher.name().to_string();
                if let Err(e) = watcher.run(tx, cancel).await {
                    error!("Watcher {} stopped: {}", name, e);
                }
            });
        }
        // the aggregator sees the queue close once every watcher is gone
        drop(tx);

        if self.settings.watchers.is_empty() {
            warn!("No log files to monitor");
        }

        let aggregator = BanAggregator::new(
            self.settings.table.clone(),
            self.state.clone(),
            self.block.clone(),
        );
        tasks.spawn(aggregator.run(rx, cancel.clone()));

        let sweeper = ExpirySweeper::new(
            self.settings.table.clone(),
            self.settings.watch_while,
            self.settings.sweep_interval,
            self.state.clone(),
            self.block.clone(),
        );
        tasks.spawn(sweeper.run(cancel.clone()));

        info!("Run forever loop");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("Task failed: {}", e);
            }
        }
        info!("vilain stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::MemoryTable;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::time::Duration;

    fn settings() -> Settings {
        Settings {
            watch_while: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            sleep_time: Duration::from_secs(1),
            default_max_tries: 3,
            table: "vilain_bruteforce".to_string(),
            ignore: BTreeSet::new(),
            log_file: PathBuf::from("/tmp/vilain.log"),
            pfctl: "pfctl".to_string(),
            watchers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_seed_from_block_table() {
        let table = Arc::new(MemoryTable::with_entries(["10.0.0.1", "10.0.0.2"]));
        let vilain = Vilain::new(settings(), table.clone());

        assert_eq!(vilain.seed().await, 2);
        let state = vilain.state();
        let state = state.lock().await;
        assert_eq!(state.get("10.0.0.1").unwrap().count, 1);
        assert_eq!(state.get("10.0.0.2").unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_seed_with_unreadable_table() {
        let vilain = Vilain::new(settings(), Arc::new(MemoryTable::failing()));
        assert_eq!(vilain.seed().await, 0);
        assert!(vilain.state().lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_bans_expire() {
        let table = Arc::new(MemoryTable::with_entries(["10.0.0.1"]));
        let vilain = Vilain::new(settings(), table.clone());
        let state = vilain.state();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(vilain.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(state.lock().await.contains("10.0.0.1"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(table.deletes(), vec!["10.0.0.1".to_string()]);
        assert!(state.lock().await.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
