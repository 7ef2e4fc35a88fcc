//! Control-plane token definitions.
//!
//! During login the server answers LOGIN7 with a token stream: environment
//! changes, an optional FEDAUTHINFO, LOGINACK, FEATUREEXTACK, errors and
//! informational messages, and a closing DONE. The transport splits that
//! stream into `(token type, body)` records; the decoders below take the body
//! that follows the token type byte.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

use crate::capability::ServerVersion;
use crate::codec::{read_b_varchar, read_us_varchar, utf16_from_bytes};
use crate::error::ProtocolError;
use crate::session_recovery::{SessionRecoveryRecord, SessionRecoveryRecords};
use crate::version::TdsVersion;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Done (DONE).
    Done = 0xFD,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAD => Some(Self::LoginAck),
            0xAE => Some(Self::FeatureExtAck),
            0xE3 => Some(Self::EnvChange),
            0xE4 => Some(Self::SessionState),
            0xEE => Some(Self::FedAuthInfo),
            0xFD => Some(Self::Done),
            _ => None,
        }
    }
}

impl TryFrom<u8> for TokenType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Self::from_u8(value).ok_or(ProtocolError::InvalidTokenType(value))
    }
}

// =============================================================================
// Collation
// =============================================================================

/// SQL collation as carried by the collation environment change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Collation {
    /// LCID and comparison flags.
    pub info: u32,
    /// SQL sort order id (0 for Windows collations).
    pub sort_id: u8,
}

impl Collation {
    /// Encoded size in bytes.
    pub const SIZE: usize = 5;

    /// Decode from a 5-byte collation value.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < Self::SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: Self::SIZE,
                actual: src.remaining(),
            });
        }
        Ok(Self {
            info: src.get_u32_le(),
            sort_id: src.get_u8(),
        })
    }

    /// Encode to the 5-byte wire form.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.info);
        dst.put_u8(self.sort_id);
    }

    /// Locale id portion of the collation.
    #[must_use]
    pub const fn lcid(&self) -> u32 {
        self.info & 0x000F_FFFF
    }
}

// =============================================================================
// DONE
// =============================================================================

bitflags! {
    /// DONE token status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// Error occurred.
        const ERROR = 0x0002;
        /// Transaction in progress.
        const IN_XACT = 0x0004;
        /// Row count is valid.
        const COUNT = 0x0010;
        /// Attention acknowledgment.
        const ATTN = 0x0020;
        /// Server error caused statement termination.
        const SRVERROR = 0x0100;
    }
}

/// Done token closing a login response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count (if applicable).
    pub row_count: u64,
}

impl Done {
    /// Size of the DONE token in bytes (excluding token type byte).
    pub const SIZE: usize = 12;

    /// Decode a DONE token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < Self::SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: Self::SIZE,
                actual: src.remaining(),
            });
        }

        Ok(Self {
            status: DoneStatus::from_bits_truncate(src.get_u16_le()),
            cur_cmd: src.get_u16_le(),
            row_count: src.get_u64_le(),
        })
    }

    /// Whether the server flagged the login batch as failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status
            .intersects(DoneStatus::ERROR | DoneStatus::SRVERROR)
    }
}

// =============================================================================
// ERROR / INFO
// =============================================================================

/// Server error or informational message.
///
/// ERROR and INFO share one layout; only the token type differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Error severity class.
    pub class: u8,
    /// Error message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerError {
    /// Decode an ERROR or INFO token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let length = src.get_u16_le() as usize;
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }
        let mut body = src.copy_to_bytes(length);

        if body.remaining() < 6 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let number = body.get_i32_le();
        let state = body.get_u8();
        let class = body.get_u8();

        let message = read_us_varchar(&mut body)?;
        let server = read_b_varchar(&mut body)?;
        let procedure = read_b_varchar(&mut body)?;

        if body.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let line = body.get_i32_le();

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Check if this is a fatal error (severity >= 20).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }

    /// Check if the message is informational only (severity <= 10).
    #[must_use]
    pub const fn is_informational(&self) -> bool {
        self.class <= 10
    }
}

// =============================================================================
// LOGINACK
// =============================================================================

/// Login acknowledgment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type (1 = SQL).
    pub interface: u8,
    /// Negotiated TDS version.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server product version.
    pub server_version: ServerVersion,
}

impl LoginAck {
    /// Decode a LOGINACK token from bytes.
    ///
    /// The TDS version is transmitted most-significant byte first, unlike the
    /// rest of the token stream.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let length = src.get_u16_le() as usize;
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }
        let mut body = src.copy_to_bytes(length);

        if body.remaining() < 5 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let interface = body.get_u8();
        let tds_version = TdsVersion::new(body.get_u32());
        let prog_name = read_b_varchar(&mut body)?;

        if body.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let major = body.get_u8();
        let minor = body.get_u8();
        let build = body.get_u16();

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            server_version: ServerVersion {
                major,
                minor,
                build,
            },
        })
    }
}

// =============================================================================
// ENVCHANGE
// =============================================================================

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Database changed.
    Database = 1,
    /// Language changed.
    Language = 2,
    /// Character set changed.
    CharacterSet = 3,
    /// Packet size changed.
    PacketSize = 4,
    /// Unicode data sorting locale ID.
    UnicodeSortingLocalId = 5,
    /// Unicode comparison flags.
    UnicodeComparisonFlags = 6,
    /// SQL collation.
    SqlCollation = 7,
    /// Begin transaction.
    BeginTransaction = 8,
    /// Commit transaction.
    CommitTransaction = 9,
    /// Rollback transaction.
    RollbackTransaction = 10,
    /// Enlist DTC transaction.
    EnlistDtcTransaction = 11,
    /// Defect DTC transaction.
    DefectTransaction = 12,
    /// Database mirroring partner announced by the server.
    RealTimeLogShipping = 13,
    /// Promote transaction.
    PromoteTransaction = 15,
    /// Transaction manager address.
    TransactionManagerAddress = 16,
    /// Transaction ended.
    TransactionEnded = 17,
    /// Reset connection completion acknowledgment.
    ResetConnectionCompletionAck = 18,
    /// User instance started.
    UserInstanceStarted = 19,
    /// Routing information.
    Routing = 20,
}

impl EnvChangeType {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Database),
            2 => Some(Self::Language),
            3 => Some(Self::CharacterSet),
            4 => Some(Self::PacketSize),
            5 => Some(Self::UnicodeSortingLocalId),
            6 => Some(Self::UnicodeComparisonFlags),
            7 => Some(Self::SqlCollation),
            8 => Some(Self::BeginTransaction),
            9 => Some(Self::CommitTransaction),
            10 => Some(Self::RollbackTransaction),
            11 => Some(Self::EnlistDtcTransaction),
            12 => Some(Self::DefectTransaction),
            13 => Some(Self::RealTimeLogShipping),
            15 => Some(Self::PromoteTransaction),
            16 => Some(Self::TransactionManagerAddress),
            17 => Some(Self::TransactionEnded),
            18 => Some(Self::ResetConnectionCompletionAck),
            19 => Some(Self::UserInstanceStarted),
            20 => Some(Self::Routing),
            _ => None,
        }
    }

    /// Whether this change belongs to the transaction collaborator.
    #[must_use]
    pub const fn is_transaction_event(self) -> bool {
        matches!(
            self,
            Self::BeginTransaction
                | Self::CommitTransaction
                | Self::RollbackTransaction
                | Self::EnlistDtcTransaction
                | Self::DefectTransaction
                | Self::PromoteTransaction
                | Self::TransactionManagerAddress
                | Self::TransactionEnded
        )
    }
}

/// Routing target carried by a routing environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInfo {
    /// Transport protocol; only 0 (TCP) is valid.
    pub protocol: u8,
    /// Target port.
    pub port: u16,
    /// Target server name.
    pub server: String,
    /// Database to open on the target, when the server supplies one.
    pub database: Option<String>,
}

impl RoutingInfo {
    /// Reject routing targets that cannot be connected to.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.server.is_empty() {
            return Err(ProtocolError::InvalidRoutingInfo("empty server name"));
        }
        if self.protocol != 0 {
            return Err(ProtocolError::InvalidRoutingInfo("unsupported protocol"));
        }
        if self.port == 0 {
            return Err(ProtocolError::InvalidRoutingInfo("port is zero"));
        }
        Ok(())
    }
}

/// Environment change value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// No value.
    Empty,
    /// String value.
    String(String),
    /// Binary value.
    Binary(Bytes),
    /// Routing information.
    Routing(RoutingInfo),
}

impl EnvChangeValue {
    /// The value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Environment change token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Type of environment change.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Decode an ENVCHANGE token from bytes.
    ///
    /// The whole record is consumed. Types this client does not know decode
    /// to `Ok(None)`.
    pub fn decode(src: &mut impl Buf) -> Result<Option<Self>, ProtocolError> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let length = src.get_u16_le() as usize;
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }
        let mut body = src.copy_to_bytes(length);

        if !body.has_remaining() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let raw_type = body.get_u8();
        let Some(env_type) = EnvChangeType::from_u8(raw_type) else {
            tracing::debug!(env_type = raw_type, "skipping unknown environment change");
            return Ok(None);
        };

        let malformed = |e: ProtocolError| ProtocolError::MalformedEnvChange {
            env_type: raw_type,
            reason: e.to_string(),
        };

        let (new_value, old_value) = match env_type {
            EnvChangeType::Routing => {
                let routing = Self::decode_routing_value(&mut body).map_err(malformed)?;
                (EnvChangeValue::Routing(routing), EnvChangeValue::Empty)
            }
            EnvChangeType::PromoteTransaction => {
                let new_value = read_l_varbyte(&mut body).map_err(malformed)?;
                (new_value, EnvChangeValue::Empty)
            }
            EnvChangeType::SqlCollation
            | EnvChangeType::BeginTransaction
            | EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::EnlistDtcTransaction
            | EnvChangeType::DefectTransaction
            | EnvChangeType::TransactionManagerAddress
            | EnvChangeType::TransactionEnded
            | EnvChangeType::ResetConnectionCompletionAck => {
                let new_value = read_b_varbyte(&mut body).map_err(malformed)?;
                let old_value = read_b_varbyte(&mut body).map_err(malformed)?;
                (new_value, old_value)
            }
            EnvChangeType::Database
            | EnvChangeType::Language
            | EnvChangeType::CharacterSet
            | EnvChangeType::PacketSize
            | EnvChangeType::UnicodeSortingLocalId
            | EnvChangeType::UnicodeComparisonFlags
            | EnvChangeType::RealTimeLogShipping
            | EnvChangeType::UserInstanceStarted => {
                let new_value = read_b_varchar(&mut body).map_err(malformed)?;
                // Some servers omit the old value for mirroring and user-instance records.
                let old_value = if body.has_remaining() {
                    read_b_varchar(&mut body).map_err(malformed)?
                } else {
                    String::new()
                };
                (
                    EnvChangeValue::String(new_value),
                    EnvChangeValue::String(old_value),
                )
            }
        };

        Ok(Some(Self {
            env_type,
            new_value,
            old_value,
        }))
    }

    fn decode_routing_value(src: &mut Bytes) -> Result<RoutingInfo, ProtocolError> {
        // new value: routing data length (2) + protocol (1) + port (2) + server (us_varchar)
        //            [+ database (us_varchar)]
        // old value: 0x0000
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let routing_len = src.get_u16_le() as usize;
        if src.remaining() < routing_len {
            return Err(ProtocolError::IncompletePacket {
                expected: routing_len,
                actual: src.remaining(),
            });
        }
        let mut routing = src.copy_to_bytes(routing_len);

        if routing.remaining() < 5 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let protocol = routing.get_u8();
        let port = routing.get_u16_le();
        let server = read_us_varchar(&mut routing)?;
        let database = if routing.remaining() >= 2 {
            Some(read_us_varchar(&mut routing)?).filter(|db| !db.is_empty())
        } else {
            None
        };

        Ok(RoutingInfo {
            protocol,
            port,
            server,
            database,
        })
    }

    /// Routing target, if this is a routing change.
    #[must_use]
    pub fn routing(&self) -> Option<&RoutingInfo> {
        match &self.new_value {
            EnvChangeValue::Routing(info) => Some(info),
            _ => None,
        }
    }

    /// New collation, if this is a collation change carrying one.
    pub fn collation(&self) -> Result<Option<Collation>, ProtocolError> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::SqlCollation, EnvChangeValue::Binary(b)) if !b.is_empty() => {
                let mut cursor = b.clone();
                Collation::decode(&mut cursor).map(Some)
            }
            _ => Ok(None),
        }
    }
}

fn read_b_varbyte(src: &mut Bytes) -> Result<EnvChangeValue, ProtocolError> {
    if !src.has_remaining() {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = src.get_u8() as usize;
    take_binary(src, len)
}

fn read_l_varbyte(src: &mut Bytes) -> Result<EnvChangeValue, ProtocolError> {
    if src.remaining() < 4 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = src.get_u32_le() as usize;
    take_binary(src, len)
}

fn take_binary(src: &mut Bytes, len: usize) -> Result<EnvChangeValue, ProtocolError> {
    if len == 0 {
        return Ok(EnvChangeValue::Empty);
    }
    if src.remaining() < len {
        return Err(ProtocolError::IncompletePacket {
            expected: len,
            actual: src.remaining(),
        });
    }
    Ok(EnvChangeValue::Binary(src.copy_to_bytes(len)))
}

// =============================================================================
// FEATUREEXTACK
// =============================================================================

/// Individual feature acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    /// Raw feature ID.
    pub feature_id: u8,
    /// Feature data.
    pub data: Bytes,
}

/// Feature extension acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureExtAck {
    /// Acknowledged features, in server order.
    pub features: Vec<FeatureAck>,
}

impl FeatureExtAck {
    /// Feature terminator byte.
    pub const TERMINATOR: u8 = 0xFF;

    /// Decode a FEATUREEXTACK token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut features = Vec::new();

        loop {
            if !src.has_remaining() {
                return Err(ProtocolError::UnexpectedEof);
            }

            let feature_id = src.get_u8();
            if feature_id == Self::TERMINATOR {
                break;
            }

            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }

            let data_len = src.get_u32_le() as usize;

            if src.remaining() < data_len {
                return Err(ProtocolError::IncompletePacket {
                    expected: data_len,
                    actual: src.remaining(),
                });
            }

            let data = src.copy_to_bytes(data_len);
            features.push(FeatureAck { feature_id, data });
        }

        Ok(Self { features })
    }
}

// =============================================================================
// FEDAUTHINFO
// =============================================================================

/// Federated authentication info sent by the server before LOGINACK.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FedAuthInfo {
    /// Security token service URL (the token authority).
    pub sts_url: String,
    /// Service principal name (the token resource).
    pub spn: String,
}

impl FedAuthInfo {
    const STS_URL: u8 = 0x01;
    const SPN: u8 = 0x02;

    /// Decode a FEDAUTHINFO token from bytes.
    ///
    /// Layout: token length (4), option count (4), then per option an id (1),
    /// data length (4) and data offset (4). Offsets are relative to the byte
    /// following the token length.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let length = src.get_u32_le() as usize;
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }
        let body = src.copy_to_bytes(length);
        let mut header = body.clone();

        if header.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let count = header.get_u32_le() as usize;

        let mut info = Self::default();
        for _ in 0..count {
            if header.remaining() < 9 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let info_id = header.get_u8();
            let data_len = header.get_u32_le() as usize;
            let offset = header.get_u32_le() as usize;

            let end = offset
                .checked_add(data_len)
                .filter(|end| *end <= body.len())
                .ok_or(ProtocolError::IncompletePacket {
                    expected: offset.saturating_add(data_len),
                    actual: body.len(),
                })?;
            let value = utf16_from_bytes(&body[offset..end])?;

            match info_id {
                Self::STS_URL => info.sts_url = value,
                Self::SPN => info.spn = value,
                other => tracing::debug!(info_id = other, "ignoring unknown FEDAUTHINFO option"),
            }
        }

        Ok(info)
    }
}

// =============================================================================
// SESSIONSTATE
// =============================================================================

/// Session state token carrying changed session-state slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateToken {
    /// Sequence number; `u32::MAX` means the server gave up tracking.
    pub sequence: u32,
    /// Whether the carried state can be replayed on reconnect.
    pub recoverable: bool,
    /// Changed slots, in server order.
    pub records: Vec<SessionRecoveryRecord>,
}

impl SessionStateToken {
    /// Decode a SESSIONSTATE token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let length = src.get_u32_le() as usize;
        if length < 5 {
            return Err(ProtocolError::MalformedSessionState(
                "token shorter than its fixed header",
            ));
        }
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }
        let mut body = src.copy_to_bytes(length);

        let sequence = body.get_u32_le();
        let status = body.get_u8();
        let records = SessionRecoveryRecords::new(&body).collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            sequence,
            recoverable: status & 0x01 != 0,
            records,
        })
    }
}
