use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::SharedAddressTable;
use crate::firewall::{BlockTable, CommandStatus};

/// Forgets addresses quiet for the watch window and lifts their ban
pub struct ExpirySweeper {
    table_name: String,
    watch_while: Duration,
    interval: Duration,
    state: SharedAddressTable,
    block: Arc<dyn BlockTable>,
}

impl ExpirySweeper {
    pub fn new(
        table_name: impl Into<String>,
        watch_while: Duration,
        interval: Duration,
        state: SharedAddressTable,
        block: Arc<dyn BlockTable>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            watch_while,
            interval,
            state,
            block,
        }
    }

    /// One pass over the address table; returns the evicted addresses.
    ///
    /// Entries are removed whatever the outcome of the delete command.
    pub async fn sweep(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        let idle = state.take_idle(Instant::now(), self.watch_while);

        for address in &idle {
            let status = self.block.delete(&self.table_name, address).await;
            info!("{} not blocked any more, return code:{}", address, status);
            if let CommandStatus::Failed(ref e) = status {
                warn!(
                    "Failed to delete {} from table {}: {}",
                    address, self.table_name, e
                );
            }
        }
        debug!("Sweep done: {} addresses tracked", state.len());
        idle
    }

    /// Sweep every interval until `cancel` fires; the first sweep happens
    /// one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Expiry sweeper started, sweeping every {:?} for entries idle {:?}",
            self.interval, self.watch_while
        );
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        debug!("Expiry sweeper stopped");
    }
}
