// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::allocator::{Allocator, GrantRequest};
use crate::error::SequencerError;
use crate::metrics;
use crate::sequencerpb;
use crate::sequencerpb::sequencer_service_server::SequencerService;

pub struct SequencerServiceImpl {
    allocator: Arc<Allocator>,
}

impl SequencerServiceImpl {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self { allocator }
    }
}

#[tonic::async_trait]
impl SequencerService for SequencerServiceImpl {
    async fn next_token(
        &self,
        request: Request<sequencerpb::TokenRequest>,
    ) -> Result<Response<sequencerpb::TokenResponse>, Status> {
        let req = request.into_inner();

        // Rejected at the transport boundary (spec §4.5.5, §7,
        // §9(iii)): the allocator also asserts this, but the caller
        // should never see a successful RPC turn into a malformed
        // request the allocator had to refuse. Recorded under the same
        // "malformed" label the allocator itself uses, since this
        // request never reaches `Allocator::handle` to be counted there.
        if req.overwrite && req.replex_overwrite {
            metrics::REQUEST_COUNT.with_label_values(&["malformed"]).inc();
            return Err(Status::invalid_argument(
                "overwrite and replexOverwrite cannot both be true",
            ));
        }

        let allocator_req = GrantRequest {
            num_tokens: req.num_tokens,
            streams: req.streams.map(|s| s.ids.into_iter().map(|b| b.to_vec()).collect()),
            overwrite: req.overwrite,
            replex_overwrite: req.replex_overwrite,
            txn_resolution: req.txn_resolution,
            read_timestamp: req.read_timestamp,
            read_set: req.read_set.into_iter().map(|b| b.to_vec()).collect(),
            conflict_keys: req.conflict_keys.into_iter().map(|b| b.to_vec()).collect(),
        };

        let resp = self.allocator.handle(allocator_req).map_err(|e| match e {
            SequencerError::LeaseExhausted | SequencerError::StorageUnavailable(_) => {
                Status::unavailable(e.to_string())
            }
            SequencerError::MalformedRequest { reason } => Status::invalid_argument(reason),
        })?;

        Ok(Response::new(sequencerpb::TokenResponse {
            token: resp.token,
            backpointer_map: resp
                .backpointer_map
                .into_iter()
                .map(|(id, pos)| sequencerpb::StreamPosition { stream_id: id.into(), position: pos })
                .collect(),
            stream_tokens: resp
                .stream_tokens
                .into_iter()
                .map(|(id, pos)| sequencerpb::StreamPosition { stream_id: id.into(), position: pos })
                .collect(),
        }))
    }
}
