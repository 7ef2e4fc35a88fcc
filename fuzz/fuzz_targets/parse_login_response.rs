#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::{Done, FedAuthInfo, LoginAck, ServerError, TokenType};

#[derive(Debug, Arbitrary)]
struct Record {
    token_type: u8,
    data: Vec<u8>,
}

fuzz_target!(|records: Vec<Record>| {
    for record in records {
        let mut data = Bytes::from(record.data);
        match TokenType::from_u8(record.token_type) {
            Some(TokenType::LoginAck) => {
                if let Ok(ack) = LoginAck::decode(&mut data) {
                    let _ = ack.tds_version.validate_login_ack();
                }
            }
            Some(TokenType::Error | TokenType::Info) => {
                let _ = ServerError::decode(&mut data);
            }
            Some(TokenType::FedAuthInfo) => {
                let _ = FedAuthInfo::decode(&mut data);
            }
            Some(TokenType::Done) => {
                let _ = Done::decode(&mut data);
            }
            _ => {}
        }
    }
});
