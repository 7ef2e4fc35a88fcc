//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while decoding or validating control-plane records.
///
/// Every variant is fatal for the connection that produced it: a server that
/// sends a malformed acknowledgement cannot be trusted with a partially
/// negotiated session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The record ended before a required field.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// A length prefix announced more bytes than are available.
    #[error("incomplete record: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes announced by the length prefix.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Unknown token type byte.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// A string field was not valid UTF-16.
    #[error("invalid string encoding: {0}")]
    StringEncoding(String),

    /// A feature acknowledgement payload is shorter (or longer) than its
    /// fixed layout allows.
    #[error("feature 0x{feature_id:02X} acknowledgement has {actual} bytes, expected {expected}")]
    FeatureAckLength {
        /// Feature identifier.
        feature_id: u8,
        /// Minimum or exact length required.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// A feature acknowledgement payload has the right size but invalid content.
    #[error("malformed feature 0x{feature_id:02X} acknowledgement: {reason}")]
    MalformedFeatureAck {
        /// Feature identifier.
        feature_id: u8,
        /// What was wrong.
        reason: &'static str,
    },

    /// The server acknowledged a feature the client never requested.
    #[error("server acknowledged unrequested feature 0x{0:02X}")]
    UnrequestedFeature(u8),

    /// A capability carries a version number this client does not support.
    #[error("unsupported {feature} version {version}")]
    InvalidVersion {
        /// Capability name.
        feature: &'static str,
        /// Version received.
        version: u8,
    },

    /// LOGINACK carried a TDS version outside the supported set.
    #[error("unsupported TDS protocol version 0x{0:08X}")]
    InvalidProtocolVersion(u32),

    /// Routing environment change with an empty host, a non-TCP protocol or port zero.
    #[error("invalid routing information: {0}")]
    InvalidRoutingInfo(&'static str),

    /// An environment change value could not be interpreted.
    #[error("malformed environment change (type {env_type}): {reason}")]
    MalformedEnvChange {
        /// Raw environment change type.
        env_type: u8,
        /// What was wrong.
        reason: String,
    },

    /// A session-state record stream is inconsistent.
    #[error("malformed session state: {0}")]
    MalformedSessionState(&'static str),
}

impl ProtocolError {
    /// Whether this error reports an unsupported version rather than a
    /// structurally malformed record.
    #[must_use]
    pub fn is_version_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidVersion { .. } | Self::InvalidProtocolVersion(_)
        )
    }

    /// Whether this error reports a malformed or undersized record.
    #[must_use]
    pub fn is_violation(&self) -> bool {
        !self.is_version_error() && !matches!(self, Self::InvalidRoutingInfo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProtocolError::UnexpectedEof.is_violation());
        assert!(
            ProtocolError::FeatureAckLength {
                feature_id: 0x0E,
                expected: 1,
                actual: 0
            }
            .is_violation()
        );
        assert!(ProtocolError::InvalidProtocolVersion(0x7300_0000).is_version_error());
        assert!(!ProtocolError::InvalidRoutingInfo("empty server name").is_violation());
        assert!(!ProtocolError::InvalidRoutingInfo("empty server name").is_version_error());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::InvalidVersion {
            feature: "JSON",
            version: 7,
        };
        assert_eq!(err.to_string(), "unsupported JSON version 7");
        assert_eq!(
            ProtocolError::InvalidTokenType(0x42).to_string(),
            "invalid token type: 0x42"
        );
    }
}
