// SPDX-License-Identifier: Apache-2.0
//! Token Allocator (spec §4.5) — the serializing core.
//!
//! `Allocator::handle` is the one entry point that mutates the global
//! tail, the lease boundary, the Stream Index and the Conflict Cache.
//! All mutating calls run under a single `parking_lot::Mutex`
//! (§9 Design notes, option (a)); the query path is serialized through
//! the same lock for simplicity rather than optimized for concurrent
//! reads, since the observable result must be as if serialized either
//! way.

use parking_lot::Mutex;

use crate::conflict_cache::ConflictCache;
use crate::error::SequencerError;
use crate::lease_manager::LeaseManager;
use crate::lease_store::LeaseStore;
use crate::metrics;
use crate::stream_index::{StreamIndex, ABSENT};

pub type StreamId = Vec<u8>;
pub type ConflictKey = Vec<u8>;

/// Sentinel returned in `TokenResponse.token` for an aborted transaction.
pub const ABORT_TOKEN: i64 = -1;

#[derive(Debug, Clone, Default)]
pub struct GrantRequest {
    pub num_tokens: u32,
    /// `None` is the non-stream path (spec §4.5.3); `Some(ids)` with
    /// `ids` empty is the "streams of interest is the empty set" case
    /// (spec §9, Open Question (ii)) — these are NOT equivalent.
    pub streams: Option<Vec<StreamId>>,
    pub overwrite: bool,
    pub replex_overwrite: bool,
    pub txn_resolution: bool,
    pub read_timestamp: i64,
    pub read_set: Vec<StreamId>,
    pub conflict_keys: Vec<ConflictKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantResponse {
    pub token: i64,
    pub backpointer_map: Vec<(StreamId, i64)>,
    pub stream_tokens: Vec<(StreamId, i64)>,
}

impl GrantResponse {
    fn abort() -> Self {
        Self { token: ABORT_TOKEN, backpointer_map: Vec::new(), stream_tokens: Vec::new() }
    }
}

pub struct AllocatorConfig {
    pub lease_length: i64,
    pub lease_renewal_notice: i64,
    pub max_conflict_cache_size: usize,
    /// Administrative reset (spec §4.2 "Initial-token override").
    /// `None` means "no override" (the protocol's sentinel).
    pub initial_token: Option<i64>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            lease_length: 100_000,
            lease_renewal_notice: 10_000,
            max_conflict_cache_size: 10_000,
            initial_token: None,
        }
    }
}

struct AllocatorState {
    tail: i64,
    lease_manager: LeaseManager,
}

pub struct Allocator {
    state: Mutex<AllocatorState>,
    stream_index: StreamIndex,
    conflict_cache: ConflictCache,
}

impl Allocator {
    pub fn new(lease_store: Box<dyn LeaseStore>, config: AllocatorConfig) -> Result<Self, SequencerError> {
        let mut lease_manager = LeaseManager::new(lease_store, config.lease_length, config.lease_renewal_notice);
        let tail = lease_manager.initialize(config.initial_token)?;
        metrics::GLOBAL_TAIL.set(tail);
        Ok(Self {
            state: Mutex::new(AllocatorState { tail, lease_manager }),
            stream_index: StreamIndex::new(),
            conflict_cache: ConflictCache::new(config.max_conflict_cache_size),
        })
    }

    pub fn global_tail(&self) -> i64 {
        self.state.lock().tail
    }

    pub fn lease_boundary(&self) -> i64 {
        self.state.lock().lease_manager.current()
    }

    /// Handles a single request. Spec §4.5: dispatch is n==0 (query,
    /// §4.5.1) first, then (for n>0) streams-absent (non-stream path,
    /// §4.5.3), then transaction resolution (§4.5.4) if requested,
    /// then the grant path (§4.5.5).
    ///
    /// Every return point is timed and counted under the path label it
    /// actually resolved to (`malformed`, `query`, `grant_non_stream`,
    /// `lease_exhausted`, `txn_abort`, `txn_commit`, `grant`), mirroring
    /// `REQUEST_COUNT`'s per-path labels rather than one constant label
    /// for the whole RPC. A grant/query that resolves into an `Err`
    /// (e.g. `reserve()` hitting the lease boundary after `maybe_renew`
    /// already succeeded) is recorded as `lease_exhausted`, not under
    /// the optimistic path label it was attempting.
    pub fn handle(&self, mut req: GrantRequest) -> Result<GrantResponse, SequencerError> {
        let start = std::time::Instant::now();
        let record = |path: &str, started: std::time::Instant| {
            metrics::REQUEST_COUNT.with_label_values(&[path]).inc();
            metrics::REQUEST_LATENCY.with_label_values(&[path]).observe(started.elapsed().as_secs_f64());
        };
        let record_result = |path: &str, started: std::time::Instant, result: &Result<GrantResponse, SequencerError>| {
            record(if result.is_ok() { path } else { "lease_exhausted" }, started);
        };

        // The transport layer (sequencer_service.rs) is expected to reject
        // this combination before it ever reaches the allocator (spec
        // §4.5.5, §9(iii) documents it as "impossible"); this is the
        // allocator's own second line of defense.
        if req.overwrite && req.replex_overwrite {
            record("malformed", start);
            return Err(SequencerError::MalformedRequest {
                reason: "overwrite and replexOverwrite cannot both be true",
            });
        }

        let mut state = self.state.lock();

        if req.num_tokens == 0 {
            let resp = self.query(&state, req.streams.as_deref());
            record("query", start);
            return Ok(resp);
        }

        if let Err(e) = self.maybe_renew(&mut state) {
            record("lease_exhausted", start);
            return Err(e);
        }

        // `.take()` leaves `req.streams` as `None` rather than moving it
        // out of `req` wholesale, so `req` as a whole is still valid to
        // borrow below (`would_abort(&req)`).
        let streams = match req.streams.take() {
            None => {
                let resp = self.reserve_non_stream(&mut state, req.num_tokens);
                record_result("grant_non_stream", start, &resp);
                return resp;
            }
            Some(s) => s,
        };

        if req.txn_resolution && self.would_abort(&req) {
            metrics::TXN_ABORTS.inc();
            record("txn_abort", start);
            return Ok(GrantResponse::abort());
        }

        let resp = self.reserve_grant(
            &mut state,
            req.num_tokens,
            &streams,
            req.overwrite,
            &req.conflict_keys,
        );
        record_result(if req.txn_resolution { "txn_commit" } else { "grant" }, start, &resp);
        resp
    }

    /// Renewal failures at runtime surface as `LeaseExhausted` to the
    /// caller regardless of their underlying cause (spec §7): a
    /// distinct `StorageUnavailable` is only meaningful at startup,
    /// inside `Allocator::new`.
    fn maybe_renew(&self, state: &mut AllocatorState) -> Result<(), SequencerError> {
        let tail = state.tail;
        state.lease_manager.maybe_renew(tail).map_err(|_| SequencerError::LeaseExhausted)
    }

    fn reserve(&self, state: &mut AllocatorState, n: i64) -> Result<i64, SequencerError> {
        if !state.lease_manager.within_bound(state.tail, n) {
            return Err(SequencerError::LeaseExhausted);
        }
        let base = state.tail;
        state.tail += n;
        metrics::GLOBAL_TAIL.set(state.tail);
        Ok(base)
    }

    /// Query path, spec §4.5.1. Does not advance the tail.
    fn query(&self, state: &AllocatorState, streams: Option<&[StreamId]>) -> GrantResponse {
        match streams {
            None => GrantResponse { token: state.tail - 1, ..Default::default() },
            Some(ids) if ids.is_empty() => GrantResponse { token: state.tail - 1, ..Default::default() },
            Some(ids) => {
                let mut max_back = ABSENT;
                let mut stream_tails = Vec::with_capacity(ids.len());
                for id in ids {
                    let back = self.stream_index.query_back(id);
                    if back > max_back {
                        max_back = back;
                    }
                    stream_tails.push((id.clone(), self.stream_index.query_local(id)));
                }
                GrantResponse { token: max_back, backpointer_map: Vec::new(), stream_tokens: stream_tails }
            }
        }
    }

    /// Non-stream path, spec §4.5.3: streams is null/absent.
    fn reserve_non_stream(&self, state: &mut AllocatorState, n: u32) -> Result<GrantResponse, SequencerError> {
        let base = self.reserve(state, n as i64)?;
        Ok(GrantResponse { token: base, ..Default::default() })
    }

    /// Transaction resolution, spec §4.5.4. A transaction aborts iff
    /// any stream in `readSet` has been extended past the snapshot, or
    /// (the fine-grained extension point) any explicit conflict key
    /// was last written past it. A cache miss is always safe.
    fn would_abort(&self, req: &GrantRequest) -> bool {
        for id in &req.read_set {
            let back = self.stream_index.query_back(id);
            if back != ABSENT && back > req.read_timestamp {
                return true;
            }
        }
        for key in &req.conflict_keys {
            if let Some(pos) = self.conflict_cache.lookup(key) {
                if pos > req.read_timestamp {
                    return true;
                }
            }
        }
        false
    }

    /// Grant path, spec §4.5.5.
    fn reserve_grant(
        &self,
        state: &mut AllocatorState,
        n: u32,
        streams: &[StreamId],
        overwrite: bool,
        conflict_keys: &[ConflictKey],
    ) -> Result<GrantResponse, SequencerError> {
        let n = n as i64;
        let base = self.reserve(state, n)?;
        let end = base + n - 1;

        // overwrite=true suppresses the local-tail advance (the
        // global-log layer retried a position); replexOverwrite alone
        // behaves like a fresh write, so only `overwrite` gates this.
        let advance_local = !overwrite;

        let mut backpointer_map = Vec::with_capacity(streams.len());
        let mut stream_tokens = Vec::new();
        for id in streams {
            let (previous_back, new_local) =
                self.stream_index.update_for_grant(id, end, n, advance_local);
            backpointer_map.push((id.clone(), previous_back));
            if let Some(local) = new_local {
                stream_tokens.push((id.clone(), local));
            }
        }

        for key in conflict_keys {
            self.conflict_cache.record_write(key.clone(), end);
        }
        metrics::CONFLICT_CACHE_SIZE.set(self.conflict_cache.len() as i64);
        metrics::STREAM_COUNT.set(self.stream_index.stream_count() as i64);

        Ok(GrantResponse { token: base, backpointer_map, stream_tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_store::InMemoryLeaseStore;

    fn allocator(lease_length: i64, renewal_notice: i64) -> Allocator {
        Allocator::new(
            Box::new(InMemoryLeaseStore::default()),
            AllocatorConfig { lease_length, lease_renewal_notice: renewal_notice, ..Default::default() },
        )
        .unwrap()
    }

    fn non_stream(n: u32) -> GrantRequest {
        GrantRequest { num_tokens: n, ..Default::default() }
    }

    fn stream_grant(n: u32, streams: &[&[u8]]) -> GrantRequest {
        GrantRequest {
            num_tokens: n,
            streams: Some(streams.iter().map(|s| s.to_vec()).collect()),
            ..Default::default()
        }
    }

    // S1 — fresh boot, simple grant.
    #[test]
    fn s1_fresh_boot_simple_grant() {
        let a = allocator(100_000, 10_000);
        let r1 = a.handle(non_stream(1)).unwrap();
        assert_eq!(r1.token, 0);
        let r2 = a.handle(non_stream(1)).unwrap();
        assert_eq!(r2.token, 1);
        assert_eq!(a.lease_boundary(), 0);
    }

    // S2 — lease skip on restart.
    #[test]
    fn s2_lease_skip_on_restart() {
        let store = Box::new(InMemoryLeaseStore::default());
        store.write_lease(0).unwrap();
        let a = Allocator::new(
            store,
            AllocatorConfig { lease_length: 100_000, lease_renewal_notice: 10_000, ..Default::default() },
        )
        .unwrap();
        let r = a.handle(non_stream(1)).unwrap();
        assert_eq!(r.token, 100_000);
        assert_eq!(a.lease_boundary(), 100_000);
    }

    // S3 — back-pointer emission.
    #[test]
    fn s3_back_pointer_emission() {
        let a = allocator(100_000, 10_000);
        let r1 = a.handle(stream_grant(1, &[b"A"])).unwrap();
        let t0 = r1.token;
        assert_eq!(r1.backpointer_map, vec![(b"A".to_vec(), ABSENT)]);
        assert_eq!(r1.stream_tokens, vec![(b"A".to_vec(), 0)]);

        let r2 = a.handle(stream_grant(1, &[b"A"])).unwrap();
        assert_eq!(r2.token, t0 + 1);
        assert_eq!(r2.backpointer_map, vec![(b"A".to_vec(), t0)]);
        assert_eq!(r2.stream_tokens, vec![(b"A".to_vec(), 1)]);
    }

    // S4 — txn abort.
    #[test]
    fn s4_txn_abort() {
        let a = allocator(100_000, 10_000);
        for _ in 0..5 {
            a.handle(non_stream(1)).unwrap();
        }
        let r = a.handle(stream_grant(1, &[b"B"])).unwrap();
        assert_eq!(r.token, 5);

        let tail_before = a.global_tail();
        let abort = a
            .handle(GrantRequest {
                num_tokens: 1,
                streams: Some(vec![b"B".to_vec()]),
                txn_resolution: true,
                read_timestamp: 4,
                read_set: vec![b"B".to_vec()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(abort.token, ABORT_TOKEN);
        assert_eq!(a.global_tail(), tail_before, "aborted transaction must not advance the tail");
    }

    // S5 — overwrite flag suppresses local advance.
    #[test]
    fn s5_overwrite_suppresses_local_advance() {
        let a = allocator(100_000, 10_000);
        let r1 = a.handle(stream_grant(1, &[b"C"])).unwrap();
        assert_eq!(r1.stream_tokens, vec![(b"C".to_vec(), 0)]);

        let tail_before = a.global_tail();
        let r2 = a
            .handle(GrantRequest {
                num_tokens: 1,
                streams: Some(vec![b"C".to_vec()]),
                overwrite: true,
                ..Default::default()
            })
            .unwrap();
        assert!(r2.stream_tokens.is_empty(), "overwrite must not advance the local tail");
        assert_eq!(a.global_tail(), tail_before + 1);
        assert_eq!(r2.backpointer_map[0].1, r1.token);
    }

    // Testable Property 5 (spec §8): for a stream never touched by an
    // overwrite=T,replexOverwrite=F grant, local[s] + 1 equals the total
    // number of tokens issued on s — including for multi-token requests.
    #[test]
    fn multi_token_grant_advances_local_tail_by_num_tokens() {
        let a = allocator(100_000, 10_000);
        let r1 = a.handle(stream_grant(3, &[b"D"])).unwrap();
        assert_eq!(r1.stream_tokens, vec![(b"D".to_vec(), 2)]);

        let r2 = a.handle(stream_grant(4, &[b"D"])).unwrap();
        assert_eq!(r2.stream_tokens, vec![(b"D".to_vec(), 6)]);

        let total_issued = 3 + 4;
        assert_eq!(r2.stream_tokens[0].1 + 1, total_issued);
    }

    // S6 — renewal at threshold.
    #[test]
    fn s6_renewal_at_threshold() {
        let a = allocator(100, 10);
        for _ in 0..91 {
            a.handle(non_stream(1)).unwrap();
        }
        assert_eq!(a.lease_boundary(), 100, "lease must have renewed by the 91st grant");
        for _ in 0..110 {
            a.handle(non_stream(1)).unwrap();
        }
        assert!(a.lease_boundary() >= 200);
    }

    #[test]
    fn query_with_null_streams_returns_last_issued_position() {
        let a = allocator(100_000, 10_000);
        assert_eq!(a.handle(non_stream(0)).unwrap().token, -1);
        a.handle(non_stream(3)).unwrap();
        assert_eq!(a.handle(non_stream(0)).unwrap().token, 2);
    }

    #[test]
    fn query_with_empty_stream_set_also_returns_last_issued_position() {
        let a = allocator(100_000, 10_000);
        a.handle(non_stream(3)).unwrap();
        let q = a.handle(GrantRequest { num_tokens: 0, streams: Some(vec![]), ..Default::default() }).unwrap();
        assert_eq!(q.token, 2);
    }

    #[test]
    fn query_with_streams_returns_max_back_pointer() {
        let a = allocator(100_000, 10_000);
        a.handle(stream_grant(1, &[b"X"])).unwrap(); // X -> back 0
        a.handle(stream_grant(1, &[b"Y"])).unwrap(); // Y -> back 1
        let q = a.handle(GrantRequest {
            num_tokens: 0,
            streams: Some(vec![b"X".to_vec(), b"Y".to_vec()]),
            ..Default::default()
        }).unwrap();
        assert_eq!(q.token, 1);
        assert_eq!(q.stream_tokens, vec![(b"X".to_vec(), 0), (b"Y".to_vec(), 0)]);
    }

    #[test]
    fn malformed_overwrite_combination_is_rejected() {
        let a = allocator(100_000, 10_000);
        let result = a.handle(GrantRequest {
            num_tokens: 1,
            overwrite: true,
            replex_overwrite: true,
            ..Default::default()
        });
        assert!(matches!(result, Err(SequencerError::MalformedRequest { .. })));
    }

    #[test]
    fn lease_exhaustion_leaves_tail_unadvanced() {
        // lease_length smaller than the renewal notice so renewal never
        // triggers before the limit is hit; a storage-backed lease
        // store that always fails would be needed to force a real
        // exhaustion. Here we drive it with a lease store that fails
        // writes after the first one, simulating storage going away.
        struct FailingAfterFirstWrite {
            inner: InMemoryLeaseStore,
            writes: std::sync::atomic::AtomicUsize,
        }
        impl LeaseStore for FailingAfterFirstWrite {
            fn read_lease(&self) -> Result<Option<i64>, crate::error::StorageError> {
                self.inner.read_lease()
            }
            fn write_lease(&self, pos: i64) -> Result<(), crate::error::StorageError> {
                if self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    self.inner.write_lease(pos)
                } else {
                    Err(std::io::Error::other("store unavailable").into())
                }
            }
        }

        let store = Box::new(FailingAfterFirstWrite {
            inner: InMemoryLeaseStore::default(),
            writes: std::sync::atomic::AtomicUsize::new(0),
        });
        let a = Allocator::new(
            store,
            AllocatorConfig { lease_length: 10, lease_renewal_notice: 1, ..Default::default() },
        )
        .unwrap();
        for _ in 0..9 {
            a.handle(non_stream(1)).unwrap();
        }
        let tail_before = a.global_tail();
        // The 9th grant already needed renewal (tail=9 >= 10-1) and the
        // renewal write failed, so this call must fail without
        // advancing the tail.
        let result = a.handle(non_stream(1));
        assert!(matches!(result, Err(SequencerError::LeaseExhausted)));
        assert_eq!(a.global_tail(), tail_before);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            NonStream(u32),
            Stream(u32, Vec<u8>),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1u32..5).prop_map(Op::NonStream),
                (1u32..5, 0u8..4).prop_map(|(n, s)| Op::Stream(n, vec![s])),
            ]
        }

        proptest! {
            #[test]
            fn uniqueness_and_monotonicity(ops in proptest::collection::vec(op_strategy(), 1..200)) {
                let a = allocator(1_000_000, 100_000);
                let mut next_free: i64 = 0;
                for op in ops {
                    let (n, req) = match op {
                        Op::NonStream(n) => (n, non_stream(n)),
                        Op::Stream(n, s) => (n, stream_grant(n, &[&s])),
                    };
                    let resp = a.handle(req).unwrap();
                    // Uniqueness + monotonicity: this grant's range must
                    // start no earlier than the end of every prior grant.
                    prop_assert!(resp.token >= next_free);
                    next_free = resp.token + n as i64;
                }
            }

            #[test]
            fn back_pointer_is_non_decreasing(grants in proptest::collection::vec(1u32..5, 1..100)) {
                let a = allocator(10_000_000, 1_000_000);
                let mut last_back = ABSENT;
                for n in grants {
                    let resp = a.handle(stream_grant(n, &[b"s"])).unwrap();
                    let end = resp.token + n as i64 - 1;
                    prop_assert!(end >= last_back);
                    last_back = end;
                }
            }
        }
    }
}
