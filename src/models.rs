use tokio::sync::mpsc;
use tokio::time::Instant;

/// One regex match on a watched log, queued for the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffenseEvent {
    pub address: String,
    /// Name of the rule that matched, reported as the ban reason
    pub reason: String,
    pub max_tries: u32,
}

/// Sending half of the offense queue, one clone per watcher
pub type OffenseSender = mpsc::UnboundedSender<OffenseEvent>;

/// Receiving half of the offense queue, owned by the aggregator
pub type OffenseReceiver = mpsc::UnboundedReceiver<OffenseEvent>;

/// Unbounded so that a slow aggregator never stalls a watcher
pub fn offense_queue() -> (OffenseSender, OffenseReceiver) {
    mpsc::unbounded_channel()
}

/// Tracking data for one offending address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressState {
    pub last_seen: Instant,
    pub count: u32,
}

impl AddressState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            count: 0,
        }
    }

    /// State for an address found in the block table at startup; its real
    /// history is lost, so it counts as a single recent offense.
    pub fn seeded(now: Instant) -> Self {
        Self {
            last_seen: now,
            count: 1,
        }
    }

    pub fn record(&mut self, now: Instant) -> u32 {
        self.count += 1;
        self.last_seen = now;
        self.count
    }

    pub fn is_idle(&self, now: Instant, window: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_increments() {
        let now = Instant::now();
        let mut state = AddressState::new(now);
        assert_eq!(state.record(now), 1);
        assert_eq!(state.record(now + Duration::from_secs(3)), 2);
        assert_eq!(state.last_seen, now + Duration::from_secs(3));
    }

    #[test]
    fn test_idle() {
        let now = Instant::now();
        let state = AddressState::seeded(now);
        assert_eq!(state.count, 1);
        assert!(!state.is_idle(now + Duration::from_secs(59), Duration::from_secs(60)));
        assert!(state.is_idle(now + Duration::from_secs(60), Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_queue_fifo() {
        let (tx, mut rx) = offense_queue();
        for ip in ["10.0.0.1", "10.0.0.2"] {
            tx.send(OffenseEvent {
                address: ip.to_string(),
                reason: "ssh".to_string(),
                max_tries: 3,
            })
            .unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().address, "10.0.0.1");
        assert_eq!(rx.recv().await.unwrap().address, "10.0.0.2");
    }
}
