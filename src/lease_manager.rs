// SPDX-License-Identifier: Apache-2.0
//! Lease Manager (spec §4.2).
//!
//! Owns the in-memory copy of the lease boundary `L` and enforces that
//! the global tail never advances past `L + leaseLength`. Only ever
//! called from within the allocator's critical section; `maybeRenew`
//! is the one place in the allocator that can block on durable storage.

use crate::error::SequencerError;
use crate::lease_store::LeaseStore;
use crate::metrics;

pub struct LeaseManager {
    store: Box<dyn LeaseStore>,
    lease_length: i64,
    renewal_notice: i64,
    current: i64,
}

impl LeaseManager {
    pub fn new(store: Box<dyn LeaseStore>, lease_length: i64, renewal_notice: i64) -> Self {
        Self { store, lease_length, renewal_notice, current: 0 }
    }

    /// Establishes `L` (and the caller's initial `T`) per spec §4.2.
    /// Returns the initial global tail the allocator should start from.
    ///
    /// `initial_token`, when `Some`, is an administrative reset: it
    /// bypasses the skip-forward rule entirely and persists `L` as the
    /// given value directly.
    pub fn initialize(&mut self, initial_token: Option<i64>) -> Result<i64, SequencerError> {
        if let Some(t0) = initial_token {
            self.store.write_lease(t0)?;
            self.current = t0;
            log::info!("lease manager: initial-token override set L={}", t0);
            metrics::LEASE_BOUNDARY.set(self.current);
            return Ok(t0);
        }

        let tail = match self.store.read_lease()? {
            Some(p) => {
                // Skip the previously held range entirely: the prior
                // process may have issued any position in
                // [p, p+leaseLength), so reusing them would violate
                // total-order uniqueness.
                let new_l = p + self.lease_length;
                self.store.write_lease(new_l)?;
                self.current = new_l;
                log::info!("lease manager: skipping forward from L={} to L={}", p, new_l);
                new_l
            }
            None => {
                self.store.write_lease(0)?;
                self.current = 0;
                log::info!("lease manager: first boot, L=0");
                0
            }
        };
        metrics::LEASE_BOUNDARY.set(self.current);
        Ok(tail)
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn limit(&self) -> i64 {
        self.current + self.lease_length
    }

    /// Renews the lease if `current_tail` is within `renewal_notice` of
    /// the current limit. Errors here are not fatal to the process;
    /// the caller (the allocator) maps them onto `LeaseExhausted` for
    /// the in-flight request.
    pub fn maybe_renew(&mut self, current_tail: i64) -> Result<(), SequencerError> {
        if current_tail >= self.limit() - self.renewal_notice {
            let new_l = self.current + self.lease_length;
            self.store.write_lease(new_l)?;
            self.current = new_l;
            metrics::LEASE_BOUNDARY.set(self.current);
            metrics::LEASE_RENEWALS.inc();
            log::debug!("lease manager: renewed, L={}", new_l);
        }
        Ok(())
    }

    /// True iff granting `n` tokens starting at `tail` would stay
    /// within the current lease boundary (the invariant jointly
    /// enforced with the allocator in spec §4.2).
    pub fn within_bound(&self, tail: i64, n: i64) -> bool {
        tail + n <= self.limit()
    }
}
