#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use mssql_connect::SessionState;
use tds_protocol::SessionStateToken;

fuzz_target!(|data: &[u8]| {
    // The same bytes as a SESSIONSTATE token and as a recovery acknowledgement
    let mut state = SessionState::new();
    let _ = state.record(data);

    let mut bytes = Bytes::copy_from_slice(data);
    if let Ok(token) = SessionStateToken::decode(&mut bytes) {
        state.apply_state_token(token.sequence, token.recoverable, &token.records);
    }
    let _ = state.encode_recovery_request();
});
