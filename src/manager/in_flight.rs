//! Single-flight bookkeeping: one pending fetch per key, any number of
//! callers waiting on it.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::buffer::Buffer;
use crate::error::CacheError;
use crate::key::CacheKey;

pub(crate) type Outcome = Result<Arc<Buffer>, CacheError>;

/// Receives the outcome of a request exactly once.
pub(crate) type Waiter = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Waiters are only `Send`; the mutex makes the entry shareable between
/// the map's shards.
struct InFlight {
    source_id: String,
    waiters: Mutex<Vec<Waiter>>,
}

#[derive(Default)]
pub(crate) struct InFlightTable {
    entries: DashMap<CacheKey, InFlight>,
}

impl InFlightTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attaches `waiter` to the fetch for `key`. Returns true if no fetch was
    /// pending and the caller now owns a new one.
    pub(crate) fn join(&self, key: &CacheKey, source_id: &str, waiter: Waiter) -> bool {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(pending) => {
                let mut waiters = pending.get().waiters.lock();
                waiters.push(waiter);
                trace!(key = %key, waiters = waiters.len(), "joined in-flight fetch");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    source_id: source_id.to_string(),
                    waiters: Mutex::new(vec![waiter]),
                });
                true
            }
        }
    }

    /// Ends the fetch for `key` and delivers `outcome` to every waiter.
    /// Waiters run after the entry is gone and no map lock is held.
    pub(crate) fn finish(&self, key: &CacheKey, outcome: Outcome) -> usize {
        let Some((_, flight)) = self.entries.remove(key) else {
            return 0;
        };
        let waiters = flight.waiters.into_inner();
        let count = waiters.len();
        trace!(key = %key, source = %flight.source_id, waiters = count, "in-flight fetch resolved");
        let mut waiters = waiters.into_iter();
        let last = waiters.next_back();
        for waiter in waiters {
            waiter(outcome.clone());
        }
        // The last waiter takes the outcome itself so no extra reference
        // outlives delivery.
        if let Some(waiter) = last {
            waiter(outcome);
        }
        count
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Owned by the task running a fetch. If the task ends without calling
/// [`resolve`](Self::resolve), e.g. because it panicked or the runtime shut
/// down, the waiters are told the request was cancelled.
pub(crate) struct FlightGuard {
    table: Arc<InFlightTable>,
    key: CacheKey,
    resolved: bool,
}

impl FlightGuard {
    pub(crate) fn new(table: Arc<InFlightTable>, key: CacheKey) -> Self {
        Self {
            table,
            key,
            resolved: false,
        }
    }

    pub(crate) fn resolve(mut self, outcome: Outcome) -> usize {
        self.resolved = true;
        self.table.finish(&self.key, outcome)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.resolved {
            self.table.finish(&self.key, Err(CacheError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_shareable_across_workers() {
        assert_send_sync::<InFlightTable>();
        assert_send_sync::<Arc<InFlightTable>>();
        assert_send_sync::<FlightGuard>();
    }

    fn counting(counter: &Arc<AtomicUsize>, expect_ok: bool) -> Waiter {
        let counter = Arc::clone(counter);
        Box::new(move |outcome: Outcome| {
            assert_eq!(outcome.is_ok(), expect_ok);
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_first_joiner_owns() {
        let table = InFlightTable::new();
        let key = CacheKey::from_mapped("abc");
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(table.join(&key, "img", counting(&calls, false)));
        assert!(!table.join(&key, "img", counting(&calls, false)));
        assert!(!table.join(&key, "img", counting(&calls, false)));
        assert_eq!(table.len(), 1);

        assert_eq!(table.finish(&key, Err(CacheError::Cancelled)), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!table.contains(&key));

        // Finishing twice delivers nothing.
        assert_eq!(table.finish(&key, Err(CacheError::Cancelled)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_guard_cancels_on_drop() {
        let table = Arc::new(InFlightTable::new());
        let key = CacheKey::from_mapped("abc");
        let cancelled = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&cancelled);
        table.join(
            &key,
            "img",
            Box::new(move |outcome| {
                assert!(matches!(outcome, Err(CacheError::Cancelled)));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        drop(FlightGuard::new(Arc::clone(&table), key.clone()));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(!table.contains(&key));
    }

    #[test]
    fn test_waiter_can_rejoin() {
        let table = Arc::new(InFlightTable::new());
        let key = CacheKey::from_mapped("abc");

        let inner_table = Arc::clone(&table);
        let inner_key = key.clone();
        table.join(
            &key,
            "img",
            Box::new(move |_| {
                // No map lock is held while waiters run.
                assert!(inner_table.join(&inner_key, "img", Box::new(|_| {})));
            }),
        );
        table.finish(&key, Err(CacheError::Cancelled));
        assert!(table.contains(&key));
    }
}
