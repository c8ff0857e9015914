// SPDX-License-Identifier: Apache-2.0
pub mod allocator;
pub mod conflict_cache;
pub mod error;
pub mod lease_manager;
pub mod lease_store;
pub mod metrics;
pub mod sequencer_service;
pub mod stream_index;

pub mod sequencerpb {
    tonic::include_proto!("sequencerpb");
}
