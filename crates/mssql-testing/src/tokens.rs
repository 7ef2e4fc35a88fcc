//! Encoders for the login response records a server sends.
//!
//! Each function returns a [`TokenRecord`] whose body is laid out exactly as
//! it appears on the wire after the token type byte.

use bytes::{BufMut, BytesMut};
use mssql_connect::TokenRecord;
use tds_protocol::codec::{utf16_byte_len, write_b_varchar, write_us_varchar};
use tds_protocol::session_recovery::write_state_record;
use tds_protocol::{Collation, DoneStatus, EnvChangeType, FeatureExtAck, TdsVersion, TokenType};

/// Program name reported in LOGINACK.
pub const SERVER_PROGRAM: &str = "Microsoft SQL Server";

/// Encode a LOGINACK for `version`, reporting product version 16.0.1000.
pub fn login_ack(version: TdsVersion) -> TokenRecord {
    let mut body = BytesMut::new();
    body.put_u8(1); // interface: SQL
    // The version is the one big-endian field of the token stream.
    body.put_u32(version.raw());
    write_b_varchar(&mut body, SERVER_PROGRAM);
    body.put_u8(16);
    body.put_u8(0);
    body.put_u16(1000);
    with_u16_length(TokenType::LoginAck, &body)
}

/// Encode a string-valued ENVCHANGE.
pub fn env_change(env_type: EnvChangeType, new_value: &str, old_value: &str) -> TokenRecord {
    let mut body = BytesMut::new();
    body.put_u8(env_type as u8);
    write_b_varchar(&mut body, new_value);
    write_b_varchar(&mut body, old_value);
    with_u16_length(TokenType::EnvChange, &body)
}

/// Encode a database change.
pub fn database(new: &str, old: &str) -> TokenRecord {
    env_change(EnvChangeType::Database, new, old)
}

/// Encode a language change.
pub fn language(new: &str, old: &str) -> TokenRecord {
    env_change(EnvChangeType::Language, new, old)
}

/// Encode a packet size change.
pub fn packet_size(new: u32, old: u32) -> TokenRecord {
    env_change(EnvChangeType::PacketSize, &new.to_string(), &old.to_string())
}

/// Encode the failover partner announcement.
pub fn failover_partner(partner: &str) -> TokenRecord {
    env_change(EnvChangeType::RealTimeLogShipping, partner, "")
}

/// Encode a user-instance announcement.
pub fn user_instance(name: &str) -> TokenRecord {
    env_change(EnvChangeType::UserInstanceStarted, name, "")
}

/// Encode a collation change.
pub fn collation(new: Collation) -> TokenRecord {
    let mut body = BytesMut::new();
    body.put_u8(EnvChangeType::SqlCollation as u8);
    body.put_u8(Collation::SIZE as u8);
    new.encode(&mut body);
    body.put_u8(0);
    with_u16_length(TokenType::EnvChange, &body)
}

/// Encode a binary-valued ENVCHANGE such as a transaction event.
pub fn binary_env_change(env_type: EnvChangeType, new_value: &[u8]) -> TokenRecord {
    let mut body = BytesMut::new();
    body.put_u8(env_type as u8);
    body.put_u8(new_value.len() as u8);
    body.put_slice(new_value);
    body.put_u8(0);
    with_u16_length(TokenType::EnvChange, &body)
}

/// Encode a reset-connection acknowledgement.
pub fn reset_ack() -> TokenRecord {
    binary_env_change(EnvChangeType::ResetConnectionCompletionAck, &[])
}

/// Encode a TCP routing redirect.
pub fn routing(server: &str, port: u16, database: Option<&str>) -> TokenRecord {
    routing_with_protocol(0, server, port, database)
}

/// Encode a routing redirect with an arbitrary protocol byte.
pub fn routing_with_protocol(
    protocol: u8,
    server: &str,
    port: u16,
    database: Option<&str>,
) -> TokenRecord {
    let mut value = BytesMut::new();
    value.put_u8(protocol);
    value.put_u16_le(port);
    write_us_varchar(&mut value, server);
    if let Some(database) = database {
        write_us_varchar(&mut value, database);
    }

    let mut body = BytesMut::new();
    body.put_u8(EnvChangeType::Routing as u8);
    body.put_u16_le(value.len() as u16);
    body.put_slice(&value);
    body.put_u16_le(0); // old value
    with_u16_length(TokenType::EnvChange, &body)
}

/// Encode a FEATUREEXTACK listing `(feature id, payload)` pairs.
pub fn feature_ext_ack(features: &[(u8, &[u8])]) -> TokenRecord {
    let mut body = BytesMut::new();
    for (id, data) in features {
        body.put_u8(*id);
        body.put_u32_le(data.len() as u32);
        body.put_slice(data);
    }
    body.put_u8(FeatureExtAck::TERMINATOR);
    TokenRecord::new(TokenType::FeatureExtAck as u8, body.freeze())
}

/// Encode session-state slots as `(slot, data)` records.
pub fn state_records(slots: &[(u8, &[u8])]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for (slot, data) in slots {
        write_state_record(&mut buf, *slot, data);
    }
    buf.to_vec()
}

/// Encode a SESSIONSTATE token.
pub fn session_state(sequence: u32, recoverable: bool, slots: &[(u8, &[u8])]) -> TokenRecord {
    let records = state_records(slots);
    let mut body = BytesMut::new();
    body.put_u32_le((5 + records.len()) as u32);
    body.put_u32_le(sequence);
    body.put_u8(u8::from(recoverable));
    body.put_slice(&records);
    TokenRecord::new(TokenType::SessionState as u8, body.freeze())
}

/// Encode an ERROR token.
pub fn error(number: i32, class: u8, message: &str) -> TokenRecord {
    message_token(TokenType::Error, number, class, message)
}

/// Encode an INFO token.
pub fn info(number: i32, message: &str) -> TokenRecord {
    message_token(TokenType::Info, number, 0, message)
}

fn message_token(token: TokenType, number: i32, class: u8, message: &str) -> TokenRecord {
    let mut body = BytesMut::new();
    body.put_i32_le(number);
    body.put_u8(1); // state
    body.put_u8(class);
    write_us_varchar(&mut body, message);
    write_b_varchar(&mut body, "mock");
    write_b_varchar(&mut body, "");
    body.put_i32_le(1);
    with_u16_length(token, &body)
}

/// Encode a final DONE.
pub fn done() -> TokenRecord {
    done_with(DoneStatus::empty())
}

/// Encode a DONE flagging the login batch as failed.
pub fn done_error() -> TokenRecord {
    done_with(DoneStatus::ERROR)
}

/// Encode a DONE with explicit status flags.
pub fn done_with(status: DoneStatus) -> TokenRecord {
    let mut body = BytesMut::with_capacity(12);
    body.put_u16_le(status.bits());
    body.put_u16_le(0);
    body.put_u64_le(0);
    TokenRecord::new(TokenType::Done as u8, body.freeze())
}

/// Encode a FEDAUTHINFO carrying the token authority and resource.
pub fn fed_auth_info(sts_url: &str, spn: &str) -> TokenRecord {
    const OPTION_COUNT: u32 = 2;
    let header_len = 4 + OPTION_COUNT as usize * 9;
    let sts_len = utf16_byte_len(sts_url);
    let spn_len = utf16_byte_len(spn);

    let mut body = BytesMut::new();
    body.put_u32_le(OPTION_COUNT);
    for (id, len, offset) in [
        (0x01_u8, sts_len, header_len),
        (0x02_u8, spn_len, header_len + sts_len),
    ] {
        body.put_u8(id);
        body.put_u32_le(len as u32);
        body.put_u32_le(offset as u32);
    }
    for unit in sts_url.encode_utf16().chain(spn.encode_utf16()) {
        body.put_u16_le(unit);
    }

    let mut data = BytesMut::with_capacity(4 + body.len());
    data.put_u32_le(body.len() as u32);
    data.put_slice(&body);
    TokenRecord::new(TokenType::FedAuthInfo as u8, data.freeze())
}

fn with_u16_length(token: TokenType, body: &[u8]) -> TokenRecord {
    let mut data = BytesMut::with_capacity(2 + body.len());
    data.put_u16_le(body.len() as u16);
    data.put_slice(body);
    TokenRecord::new(token as u8, data.freeze())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{EnvChange, FedAuthInfo, LoginAck, ServerError, SessionStateToken};

    #[test]
    fn test_login_ack_decodes() {
        let record = login_ack(TdsVersion::V7_4);
        let ack = LoginAck::decode(&mut record.data.clone()).unwrap();
        assert_eq!(ack.tds_version, TdsVersion::V7_4);
        assert_eq!(ack.prog_name, SERVER_PROGRAM);
        assert_eq!(ack.server_version.major, 16);
        assert_eq!(ack.server_version.build, 1000);
    }

    #[test]
    fn test_routing_decodes() {
        let record = routing("replica.example.net", 11000, Some("sales"));
        let change = EnvChange::decode(&mut record.data.clone()).unwrap().unwrap();
        let info = change.routing().unwrap();
        assert_eq!(info.server, "replica.example.net");
        assert_eq!(info.port, 11000);
        assert_eq!(info.database.as_deref(), Some("sales"));
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_fed_auth_info_offsets() {
        let record = fed_auth_info("https://login.example.net/tenant", "https://database.example.net/");
        let info = FedAuthInfo::decode(&mut record.data.clone()).unwrap();
        assert_eq!(info.sts_url, "https://login.example.net/tenant");
        assert_eq!(info.spn, "https://database.example.net/");
    }

    #[test]
    fn test_error_and_session_state_decode() {
        let record = error(18456, 14, "Login failed for user 'app'.");
        let err = ServerError::decode(&mut record.data.clone()).unwrap();
        assert_eq!(err.number, 18456);
        assert_eq!(err.class, 14);
        assert_eq!(err.server, "mock");

        let record = session_state(7, true, &[(3, b"abc"), (9, &[0; 300])]);
        let token = SessionStateToken::decode(&mut record.data.clone()).unwrap();
        assert_eq!(token.sequence, 7);
        assert!(token.recoverable);
        assert_eq!(token.records.len(), 2);
        assert_eq!(token.records[1].data.len(), 300);
    }
}
