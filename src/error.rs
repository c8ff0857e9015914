// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors surfaced by the lease store adapter. Any error here is fatal
/// at startup and degrades to `SequencerError::LeaseExhausted` at
/// runtime (spec §7: a runtime storage failure on renewal surfaces as
/// lease exhaustion to the caller, never as a distinct wire error).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("lease store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors the Token Allocator can produce for a single `handle()` call.
#[derive(Debug, Error)]
pub enum SequencerError {
    /// The global tail could not be advanced within the current lease
    /// boundary and renewal did not (or could not) extend it in time.
    /// `T` is left unadvanced; the caller may retry.
    #[error("lease exhausted: tail would exceed the current lease boundary")]
    LeaseExhausted,

    /// The lease store failed a read or write. At startup this aborts
    /// the process; at runtime it is reported to callers identically
    /// to `LeaseExhausted` (spec §7).
    #[error("lease store unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    /// `overwrite` and `replexOverwrite` were both set, which the
    /// protocol defines as an impossible combination (spec §4.5.5,
    /// §9(iii)). Rejected before it reaches the allocator's critical
    /// section.
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: &'static str },
}
