// SPDX-License-Identifier: Apache-2.0
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_client(true)
        .build_server(false)
        .bytes(&["StreamSet.ids", "StreamPosition.stream_id", "TokenRequest.read_set", "TokenRequest.conflict_keys"])
        .compile_protos(&["../proto/sequencer.proto"], &["../proto"])?;
    Ok(())
}
