// SPDX-License-Identifier: Apache-2.0
//! Conflict Cache (spec §4.3).
//!
//! A bounded, approximate `conflict-key -> last-written-position` map.
//! `lookup` permits unlimited concurrent readers; `record_write` is
//! only ever called from the allocator's single-writer critical
//! section, so the map itself needs no write serialization of its own
//! beyond what `DashMap` already gives it.
//!
//! Eviction is a plain FIFO over insertion order, not a strict LRU:
//! the spec allows "approx. LRU/LFU" and the back-pointer map (not
//! this cache) is the safety net for abort correctness, so precise
//! recency tracking buys nothing here.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub type ConflictKey = Vec<u8>;

pub struct ConflictCache {
    entries: DashMap<ConflictKey, i64>,
    insertion_order: Mutex<VecDeque<ConflictKey>>,
    max_size: usize,
}

impl ConflictCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(max_size),
            insertion_order: Mutex::new(VecDeque::with_capacity(max_size)),
            max_size,
        }
    }

    /// Last recorded global position for `key`, or `None`. A `None`
    /// result is ambiguous: the key may never have been written, or it
    /// may have been evicted. Callers must treat it conservatively.
    pub fn lookup(&self, key: &[u8]) -> Option<i64> {
        self.entries.get(key).map(|v| *v)
    }

    /// Records that `key` was written at `pos`. Raises the stored
    /// value if `pos` is greater than what's there; never lowers it.
    pub fn record_write(&self, key: ConflictKey, pos: i64) {
        let is_new = match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if pos > *e.get() {
                    e.insert(pos);
                }
                false
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(pos);
                true
            }
        };

        if is_new {
            let mut order = self.insertion_order.lock();
            order.push_back(key);
            while order.len() > self.max_size {
                if let Some(evicted) = order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
