use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::SharedAddressTable;
use crate::firewall::{BlockTable, CommandStatus};
use crate::models::{OffenseEvent, OffenseReceiver};

/// Single consumer of the offense queue.
///
/// Counts offenses per address and bans once an address reaches the
/// threshold of the rule that reported it. Banned addresses stay tracked;
/// the sweeper lifts the ban once they have been quiet for the watch window.
pub struct BanAggregator {
    table_name: String,
    state: SharedAddressTable,
    block: Arc<dyn BlockTable>,
}

impl BanAggregator {
    pub fn new(
        table_name: impl Into<String>,
        state: SharedAddressTable,
        block: Arc<dyn BlockTable>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            state,
            block,
        }
    }

    /// Apply one offense; returns the block-table status when it led to a ban
    pub async fn handle(&self, event: OffenseEvent) -> Option<CommandStatus> {
        let mut state = self.state.lock().await;
        let count = state.record(&event.address, Instant::now());
        info!(
            "{} detected, reason {}, count: {}, maxtries: {}",
            event.address, event.reason, count, event.max_tries
        );

        if count < event.max_tries {
            return None;
        }

        let status = self.block.add(&self.table_name, &event.address).await;
        // vilainreport parses this line, keep the wording
        info!(
            "Blacklisting {}, reason {}, return code:{}",
            event.address, event.reason, status
        );
        if let CommandStatus::Failed(ref e) = status {
            warn!("Failed to add {} to table {}: {}", event.address, self.table_name, e);
        }
        debug!("{} addresses tracked", state.len());
        Some(status)
    }

    /// Consume the queue until it closes or `cancel` fires
    pub async fn run(self, mut queue: OffenseReceiver, cancel: CancellationToken) {
        info!("Ban aggregator started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!("Offense queue closed, no more watchers");
                        break;
                    }
                },
            };
            self.handle(event).await;
        }
        debug!("Ban aggregator stopped");
    }
}
