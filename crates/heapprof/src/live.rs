use std::mem::{size_of, take};

use rustc_hash::FxHashMap;
use spin::Mutex;

use crate::TraceHandle;

/// The information stored for a live, sampled allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivePointer {
    /// The trace at which it was allocated.
    pub trace: TraceHandle,
    /// The size of the memory allocated.
    pub size: usize,
}

#[derive(Debug, Default)]
struct LiveSet {
    blocks: FxHashMap<usize, LivePointer>,
    total: usize,
    peak: usize,
}

/// Map of live address -> trace + size, with running and peak byte totals.
///
/// Every operation runs under one spin lock held for a hash lookup and a
/// couple of additions. Addresses are opaque keys and are never dereferenced.
#[derive(Debug, Default)]
pub struct LiveAllocationTable {
    live: Mutex<LiveSet>,
}

impl LiveAllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address`. An existing entry for the same address is replaced.
    pub fn insert(&self, address: usize, trace: TraceHandle, size: usize) {
        let mut live = self.live.lock();

        let replaced = live.blocks.insert(address, LivePointer { trace, size });

        if let Some(old) = replaced {
            live.total -= old.size;
        }

        live.total += size;

        if live.total > live.peak {
            live.peak = live.total;
        }
    }

    /// Forget `address`, returning the size it was recorded with.
    pub fn remove(&self, address: usize) -> Option<usize> {
        let mut live = self.live.lock();

        let removed = live.blocks.remove(&address)?;

        live.total -= removed.size;

        Some(removed.size)
    }

    pub fn find(&self, address: usize) -> Option<LivePointer> {
        self.live.lock().blocks.get(&address).copied()
    }

    /// Addresses currently tracked, in no particular order.
    pub fn snapshot(&self) -> Vec<usize> {
        self.live.lock().blocks.keys().copied().collect()
    }

    /// Addresses currently tracked together with their records.
    pub fn entries(&self) -> Vec<(usize, LivePointer)> {
        self.live
            .lock()
            .blocks
            .iter()
            .map(|(address, pointer)| (*address, *pointer))
            .collect()
    }

    /// Entries together with the total and peak bytes, read under one lock so
    /// the total is always the sum of the returned sizes.
    pub fn entries_with_totals(&self) -> (Vec<(usize, LivePointer)>, usize, usize) {
        let live = self.live.lock();

        let entries = live
            .blocks
            .iter()
            .map(|(address, pointer)| (*address, *pointer))
            .collect();

        (entries, live.total, live.peak)
    }

    pub fn len(&self) -> usize {
        self.live.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().blocks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.live.lock().total
    }

    pub fn peak_bytes(&self) -> usize {
        self.live.lock().peak
    }

    /// Drop every record and zero both totals.
    pub fn reset(&self) {
        let released = {
            let mut live = self.live.lock();
            live.total = 0;
            live.peak = 0;
            take(&mut live.blocks)
        };

        // freed outside of the spin lock.
        drop(released);
    }

    /// Estimated heap bytes held by the table.
    pub fn memory_usage(&self) -> usize {
        self.live.lock().blocks.capacity() * size_of::<(usize, LivePointer)>()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Barrier};

    use super::*;

    #[test]
    fn tracks_total_and_peak() {
        let table = LiveAllocationTable::new();

        table.insert(123, TraceHandle::EMPTY, 12);
        table.insert(456, TraceHandle::EMPTY, 6);
        table.insert(789, TraceHandle::EMPTY, 36);

        assert_eq!(table.total_bytes(), 54);
        assert_eq!(table.peak_bytes(), 54);
        assert_eq!(table.len(), 3);

        assert_eq!(table.remove(456), Some(6));

        assert_eq!(table.total_bytes(), 48);
        assert_eq!(table.peak_bytes(), 54);
        assert_eq!(table.find(456), None);
        assert_eq!(
            table.find(123),
            Some(LivePointer {
                trace: TraceHandle::EMPTY,
                size: 12
            })
        );
    }

    #[test]
    fn remove_of_unknown_address_is_noop() {
        let table = LiveAllocationTable::new();
        table.insert(1, TraceHandle::EMPTY, 10);

        assert_eq!(table.remove(2), None);
        assert_eq!(table.remove(1), Some(10));
        assert_eq!(table.remove(1), None);

        assert_eq!(table.total_bytes(), 0);
        assert_eq!(table.peak_bytes(), 10);
        assert!(table.is_empty());
    }

    #[test]
    fn insert_overwrites_existing_address() {
        let table = LiveAllocationTable::new();

        table.insert(1, TraceHandle::EMPTY, 100);
        table.insert(1, TraceHandle::EMPTY, 30);

        assert_eq!(table.len(), 1);
        assert_eq!(table.total_bytes(), 30);
        assert_eq!(table.peak_bytes(), 100);
        assert_eq!(table.find(1).map(|p| p.size), Some(30));
    }

    #[test]
    fn entries_with_totals_is_consistent() {
        let table = LiveAllocationTable::new();
        table.insert(1, TraceHandle::EMPTY, 100);
        table.insert(2, TraceHandle::EMPTY, 20);
        table.remove(1);

        let (entries, total, peak) = table.entries_with_totals();

        assert_eq!(entries, vec![(2, LivePointer { trace: TraceHandle::EMPTY, size: 20 })]);
        assert_eq!(total, 20);
        assert_eq!(peak, 120);
    }

    #[test]
    fn reset_zeroes_peak() {
        let table = LiveAllocationTable::new();
        table.insert(1, TraceHandle::EMPTY, 100);

        table.reset();

        assert_eq!(table.total_bytes(), 0);
        assert_eq!(table.peak_bytes(), 0);
        assert!(table.snapshot().is_empty());

        table.insert(2, TraceHandle::EMPTY, 5);
        assert_eq!(table.peak_bytes(), 5);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let table = LiveAllocationTable::new();
        let barrier = Barrier::new(THREADS);

        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let table = &table;
                let barrier = &barrier;

                scope.spawn(move || {
                    barrier.wait();

                    for i in 0..PER_THREAD {
                        // disjoint addresses per thread plus a shared range.
                        let own = (thread * PER_THREAD + i + 1) * 16;
                        table.insert(own, TraceHandle::EMPTY, 8);

                        let shared = usize::MAX - (i % 64);
                        table.insert(shared, TraceHandle::EMPTY, 4);
                        table.remove(shared);

                        if i % 2 == 0 {
                            table.remove(own);
                        }
                    }
                });
            }
        });

        let entries: HashMap<usize, LivePointer> = table.entries().into_iter().collect();
        let sum: usize = entries.values().map(|p| p.size).sum();

        assert_eq!(entries.len(), THREADS * PER_THREAD / 2);
        assert_eq!(table.total_bytes(), sum);
        assert_eq!(sum, THREADS * PER_THREAD / 2 * 8);
        assert!(table.peak_bytes() >= table.total_bytes());
    }
}
