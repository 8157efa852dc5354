use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::AddressState;

/// Address table shared by the aggregator and the sweeper.
///
/// Both take the lock for their whole critical section, block-table call
/// included.
pub type SharedAddressTable = Arc<Mutex<AddressTable>>;

/// Per-address offense tracking, at most one entry per address
#[derive(Debug, Default)]
pub struct AddressTable {
    entries: HashMap<String, AddressState>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedAddressTable {
        Arc::new(Mutex::new(self))
    }

    /// Track addresses already present in the block table.
    ///
    /// Returns how many new entries were created.
    pub fn seed<I>(&mut self, addresses: I, now: Instant) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = 0;
        for address in addresses {
            if let std::collections::hash_map::Entry::Vacant(slot) = self.entries.entry(address) {
                slot.insert(AddressState::seeded(now));
                added += 1;
            }
        }
        added
    }

    /// Count one more offense for `address`, returning the new count
    pub fn record(&mut self, address: &str, now: Instant) -> u32 {
        self.entries
            .entry(address.to_string())
            .or_insert_with(|| AddressState::new(now))
            .record(now)
    }

    /// Remove and return every address idle for at least `window`, sorted
    pub fn take_idle(&mut self, now: Instant, window: Duration) -> Vec<String> {
        let mut idle: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, state)| state.is_idle(now, window))
            .map(|(address, _)| address.clone())
            .collect();
        idle.sort();

        for address in &idle {
            self.entries.remove(address);
        }
        idle
    }

    pub fn get(&self, address: &str) -> Option<&AddressState> {
        self.entries.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
