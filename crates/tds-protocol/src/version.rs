//! TDS protocol version definitions.

use core::fmt;

use crate::error::ProtocolError;

/// TDS protocol version as carried by LOGIN7 and LOGINACK.
///
/// TDS 8.0 uses an encoding (`0x08000000`) that is numerically lower than
/// every 7.x version, so this type deliberately does not implement `Ord`.
/// Compare [`ServerGeneration`] values instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x70000000);

    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x71000000);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x72090002);

    /// TDS 7.3A (SQL Server 2008 pre-release)
    pub const V7_3A: Self = Self(0x730A0003);

    /// TDS 7.3B (SQL Server 2008)
    pub const V7_3B: Self = Self(0x730B0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x74000004);

    /// TDS 8.0 (SQL Server 2022+ strict encryption mode)
    pub const V8_0: Self = Self(0x08000000);

    /// Create a new TDS version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Get the raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this version is TDS 8.0.
    #[must_use]
    pub const fn is_tds_8(self) -> bool {
        self.0 == Self::V8_0.0
    }

    /// Server generation for a version acknowledged in LOGINACK.
    ///
    /// Only the exact values a server may answer with are accepted; in
    /// particular TDS 7.3A and the 7.0/7.1 family are rejected.
    #[must_use]
    pub const fn server_generation(self) -> Option<ServerGeneration> {
        match self.0 {
            0x72090002 => Some(ServerGeneration::Sql2005),
            0x730B0003 => Some(ServerGeneration::Sql2008),
            0x74000004 => Some(ServerGeneration::Sql2012),
            0x08000000 => Some(ServerGeneration::Sql2022),
            _ => None,
        }
    }

    /// Validate a LOGINACK version against the supported set.
    pub fn validate_login_ack(self) -> Result<ServerGeneration, ProtocolError> {
        self.server_generation()
            .ok_or(ProtocolError::InvalidProtocolVersion(self.0))
    }

    /// Check if this version supports session recovery (connection resiliency).
    #[must_use]
    pub const fn supports_session_recovery(self) -> bool {
        self.is_tds_8() || self.0 >= Self::V7_4.0
    }

    /// Parse a TDS version from "7.4", "8.0" style strings.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7.2" => Some(Self::V7_2),
            "7.3" | "7.3b" => Some(Self::V7_3B),
            "7.3a" => Some(Self::V7_3A),
            "7.4" => Some(Self::V7_4),
            "8.0" | "8" => Some(Self::V8_0),
            _ => None,
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0x08000000 => write!(f, "TDS 8.0"),
            0x74000004 => write!(f, "TDS 7.4"),
            0x730B0003 => write!(f, "TDS 7.3B"),
            0x730A0003 => write!(f, "TDS 7.3A"),
            0x72090002 => write!(f, "TDS 7.2"),
            other => write!(f, "TDS 0x{other:08X}"),
        }
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Server product generation implied by the negotiated protocol version.
///
/// Ordered oldest to newest, so `generation >= ServerGeneration::Sql2012`
/// reads as "SQL Server 2012 or newer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerGeneration {
    /// SQL Server 2005 (TDS 7.2).
    Sql2005,
    /// SQL Server 2008 / 2008 R2 (TDS 7.3B).
    Sql2008,
    /// SQL Server 2012 through 2019 (TDS 7.4).
    Sql2012,
    /// SQL Server 2022 strict mode (TDS 8.0).
    Sql2022,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_login_ack_allow_list() {
        assert_eq!(
            TdsVersion::V7_2.validate_login_ack().unwrap(),
            ServerGeneration::Sql2005
        );
        assert_eq!(
            TdsVersion::V7_3B.validate_login_ack().unwrap(),
            ServerGeneration::Sql2008
        );
        assert_eq!(
            TdsVersion::V7_4.validate_login_ack().unwrap(),
            ServerGeneration::Sql2012
        );
        assert_eq!(
            TdsVersion::V8_0.validate_login_ack().unwrap(),
            ServerGeneration::Sql2022
        );
    }

    #[test]
    fn test_login_ack_rejects_unlisted_versions() {
        for raw in [0x70000000, 0x71000001, 0x730A0003, 0x72080002, 0x75000005, 0] {
            assert_eq!(
                TdsVersion::new(raw).validate_login_ack(),
                Err(ProtocolError::InvalidProtocolVersion(raw))
            );
        }
    }

    #[test]
    fn test_generation_order() {
        assert!(ServerGeneration::Sql2022 > ServerGeneration::Sql2012);
        assert!(ServerGeneration::Sql2012 > ServerGeneration::Sql2008);
        assert!(ServerGeneration::Sql2008 > ServerGeneration::Sql2005);
    }

    #[test]
    fn test_supports_session_recovery() {
        assert!(TdsVersion::V7_4.supports_session_recovery());
        assert!(TdsVersion::V8_0.supports_session_recovery());
        assert!(!TdsVersion::V7_3B.supports_session_recovery());
    }

    #[test]
    fn test_parse() {
        assert_eq!(TdsVersion::parse("7.3"), Some(TdsVersion::V7_3B));
        assert_eq!(TdsVersion::parse("7.3A"), Some(TdsVersion::V7_3A));
        assert_eq!(TdsVersion::parse(" 7.4 "), Some(TdsVersion::V7_4));
        assert_eq!(TdsVersion::parse("8"), Some(TdsVersion::V8_0));
        assert_eq!(TdsVersion::parse("9.0"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TdsVersion::V7_4.to_string(), "TDS 7.4");
        assert_eq!(TdsVersion::V8_0.to_string(), "TDS 8.0");
        assert_eq!(TdsVersion::new(0x1234).to_string(), "TDS 0x00001234");
    }
}
