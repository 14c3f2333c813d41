use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;
use pregen_world::BatchKey;

/// Outstanding-cell counter of one claimed batch.
#[derive(Debug)]
pub struct BatchTicket {
    key: BatchKey,
    serial: u64,
    remaining: AtomicUsize,
}

impl BatchTicket {
    pub fn key(&self) -> BatchKey {
        self.key
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Batches currently in flight for one partition, keyed by bucket.
///
/// A bucket stays open from [`claim`](Self::claim) until its ticket drains to zero or the
/// claim is [`abandon`](Self::abandon)ed. Removal only happens if the open entry is still the
/// same ticket, so a stale ticket from an abandoned claim never closes a newer one.
#[derive(Debug, Default)]
pub struct BatchLedger {
    open: Mutex<HashMap<BatchKey, Arc<BatchTicket>>>,
    next_serial: AtomicU64,
}

impl BatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<BatchKey, Arc<BatchTicket>>> {
        self.open.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Opens `key` with a counter of `size`. Returns `None` when the bucket is already open.
    pub fn claim(&self, key: BatchKey, size: usize) -> Option<Arc<BatchTicket>> {
        let mut open = self.guard();
        if open.contains_key(&key) {
            return None;
        }
        let ticket = Arc::new(BatchTicket {
            key,
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            remaining: AtomicUsize::new(size),
        });
        open.insert(key, Arc::clone(&ticket));
        Some(ticket)
    }

    pub fn is_open(&self, key: BatchKey) -> bool {
        self.guard().contains_key(&key)
    }

    /// Counts one member of the batch as resolved. Returns `true` when this was the last one
    /// and the bucket was closed.
    pub fn settle_one(&self, ticket: &Arc<BatchTicket>) -> bool {
        let prev = ticket
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.close(ticket),
            _ => false,
        }
    }

    /// Closes the bucket early so its unprocessed cells can be rediscovered.
    pub fn abandon(&self, ticket: &Arc<BatchTicket>) -> bool {
        self.close(ticket)
    }

    fn close(&self, ticket: &Arc<BatchTicket>) -> bool {
        let mut open = self.guard();
        match open.get(&ticket.key) {
            Some(current) if Arc::ptr_eq(current, ticket) => {
                open.remove(&ticket.key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_to_zero_then_closes() {
        let ledger = BatchLedger::new();
        let key = BatchKey::new(1, 2);
        let t = ledger.claim(key, 3).unwrap();
        assert!(ledger.claim(key, 3).is_none());
        assert!(!ledger.settle_one(&t));
        assert!(!ledger.settle_one(&t));
        assert!(ledger.settle_one(&t));
        assert!(!ledger.is_open(key));
        // extra settles are ignored
        assert!(!ledger.settle_one(&t));
        assert_eq!(t.remaining(), 0);
    }

    #[test]
    fn stale_ticket_does_not_close_newer_claim() {
        let ledger = BatchLedger::new();
        let key = BatchKey::new(0, 0);
        let old = ledger.claim(key, 2).unwrap();
        assert!(ledger.abandon(&old));
        let new = ledger.claim(key, 1).unwrap();
        assert!(!ledger.settle_one(&old));
        assert!(!ledger.settle_one(&old));
        assert!(ledger.is_open(key));
        assert!(ledger.settle_one(&new));
        assert!(ledger.is_empty());
    }
}
