//! Per-address admission control.
//!
//! The ledger counts live sessions per peer address. It has a fixed number
//! of slots; once an address has been seen its slot is kept even when the
//! count drops back to zero, so the capacity bounds the number of distinct
//! addresses ever admitted.

use parking_lot::Mutex;

#[derive(Debug)]
struct Entry {
    address: String,
    count: u32,
}

/// Fixed-capacity connection counter keyed by address.
#[derive(Debug)]
pub struct AdmissionLedger {
    max_per_address: u32,
    capacity: usize,
    entries: Mutex<Vec<Entry>>,
}

impl AdmissionLedger {
    pub fn new(max_per_address: u32, capacity: usize) -> Self {
        Self {
            max_per_address,
            capacity,
            entries: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Takes a permit for `address`. Returns false, without counting, when
    /// the address is at its ceiling or the ledger has no room for it.
    pub fn allow(&self, address: &str) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.address == address) {
            if entry.count >= self.max_per_address {
                return false;
            }
            entry.count += 1;
            return true;
        }

        if entries.len() >= self.capacity || self.max_per_address == 0 {
            return false;
        }
        entries.push(Entry {
            address: address.to_string(),
            count: 1,
        });
        true
    }

    /// Returns a permit. Unknown addresses and zero counts are left alone.
    pub fn release(&self, address: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.address == address) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    /// Whether `allow` would currently succeed. Takes no permit.
    pub fn would_allow(&self, address: &str) -> bool {
        let entries = self.entries.lock();
        match entries.iter().find(|e| e.address == address) {
            Some(entry) => entry.count < self.max_per_address,
            None => entries.len() < self.capacity && self.max_per_address > 0,
        }
    }

    /// Live permits held by `address`.
    pub fn count(&self, address: &str) -> u32 {
        self.entries
            .lock()
            .iter()
            .find(|e| e.address == address)
            .map_or(0, |e| e.count)
    }

    /// Distinct addresses recorded so far.
    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn max_per_address(&self) -> u32 {
        self.max_per_address
    }
}
