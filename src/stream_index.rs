// SPDX-License-Identifier: Apache-2.0
//! Stream Index (spec §4.4).
//!
//! Two parallel maps keyed by stream-id: the local tail (count of
//! entries issued on that stream, minus one) and the back-pointer
//! (last global position at which the stream was extended). Both are
//! only ever updated from the allocator's single critical section per
//! grant, so an external reader never observes one updated without
//! the other for the same grant.

use dashmap::DashMap;

pub type StreamId = Vec<u8>;

pub const ABSENT: i64 = -1;

#[derive(Default)]
pub struct StreamIndex {
    local: DashMap<StreamId, i64>,
    back: DashMap<StreamId, i64>,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_local(&self, id: &[u8]) -> i64 {
        self.local.get(id).map(|v| *v).unwrap_or(ABSENT)
    }

    pub fn query_back(&self, id: &[u8]) -> i64 {
        self.back.get(id).map(|v| *v).unwrap_or(ABSENT)
    }

    /// Records a grant touching `id` for `n` tokens, whose last allocated
    /// position is `end`. `advance_local` is `false` for an
    /// `overwrite`-only retry (spec §4.5.5 table), in which case the
    /// back-pointer still advances but the local tail does not.
    ///
    /// Returns `(previous_back_pointer, new_local_tail)`, where
    /// `new_local_tail` is `None` when the local tail wasn't advanced.
    pub fn update_for_grant(&self, id: &[u8], end: i64, n: i64, advance_local: bool) -> (i64, Option<i64>) {
        let previous_back = {
            let mut entry = self.back.entry(id.to_vec()).or_insert(ABSENT);
            let previous = *entry;
            *entry = previous.max(end);
            previous
        };

        let new_local = if advance_local {
            let mut entry = self.local.entry(id.to_vec()).or_insert(ABSENT);
            *entry += n;
            Some(*entry)
        } else {
            None
        };

        (previous_back, new_local)
    }

    pub fn stream_count(&self) -> usize {
        self.back.len()
    }
}
