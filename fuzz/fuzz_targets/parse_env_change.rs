#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::token::EnvChange;

fuzz_target!(|data: &[u8]| {
    // Database, language, collation, partner and routing records
    let mut bytes = Bytes::copy_from_slice(data);
    if let Ok(Some(change)) = EnvChange::decode(&mut bytes) {
        if let Some(routing) = change.routing() {
            let _ = routing.validate();
        }
        let _ = change.collation();
    }
});
