#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::{CapabilitySet, FeatureExtAck, RequestedFeatures};

#[derive(Debug, Arbitrary)]
struct FeatureAckInput {
    requested: u16,
    token: Vec<u8>,
}

fuzz_target!(|input: FeatureAckInput| {
    let mut bytes = Bytes::from(input.token);
    let Ok(ack) = FeatureExtAck::decode(&mut bytes) else {
        return;
    };

    let mut capabilities =
        CapabilitySet::new(RequestedFeatures::from_bits_truncate(input.requested));
    for feature in ack.features {
        if capabilities
            .process_feature_ack(feature.feature_id, &feature.data)
            .is_err()
        {
            break;
        }
    }
    let _ = capabilities.data_classification();
    let _ = capabilities.enclave_type();
});
