//! LOGIN7 feature extensions and their acknowledgement identifiers.

use bitflags::bitflags;

/// Feature extension identifier shared by the LOGIN7 FeatureExt block and
/// the FEATUREEXTACK token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery (connection resiliency).
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Column encryption.
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// Azure SQL support.
    AzureSqlSupport = 0x08,
    /// Data classification.
    DataClassification = 0x09,
    /// UTF-8 support.
    Utf8Support = 0x0A,
    /// Azure SQL DNS caching.
    AzureSqlDnsCaching = 0x0B,
    /// JSON type support.
    Json = 0x0D,
    /// Vector type support.
    Vector = 0x0E,
    /// Enhanced routing.
    EnhancedRouting = 0x0F,
    /// Terminator.
    Terminator = 0xFF,
}

impl FeatureId {
    /// Map a raw identifier to a known feature.
    ///
    /// Unknown identifiers return `None`; callers skip them so newer servers
    /// can advertise features this client has never heard of.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::SessionRecovery),
            0x02 => Some(Self::FedAuth),
            0x04 => Some(Self::ColumnEncryption),
            0x05 => Some(Self::GlobalTransactions),
            0x08 => Some(Self::AzureSqlSupport),
            0x09 => Some(Self::DataClassification),
            0x0A => Some(Self::Utf8Support),
            0x0B => Some(Self::AzureSqlDnsCaching),
            0x0D => Some(Self::Json),
            0x0E => Some(Self::Vector),
            0x0F => Some(Self::EnhancedRouting),
            0xFF => Some(Self::Terminator),
            _ => None,
        }
    }

    /// Human-readable feature name used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SessionRecovery => "session recovery",
            Self::FedAuth => "federated authentication",
            Self::ColumnEncryption => "column encryption",
            Self::GlobalTransactions => "global transactions",
            Self::AzureSqlSupport => "Azure SQL support",
            Self::DataClassification => "data classification",
            Self::Utf8Support => "UTF-8 support",
            Self::AzureSqlDnsCaching => "DNS caching",
            Self::Json => "JSON",
            Self::Vector => "vector",
            Self::EnhancedRouting => "enhanced routing",
            Self::Terminator => "terminator",
        }
    }

    /// The request flag corresponding to this feature.
    #[must_use]
    pub fn request_flag(self) -> RequestedFeatures {
        match self {
            Self::SessionRecovery => RequestedFeatures::SESSION_RECOVERY,
            Self::FedAuth => RequestedFeatures::FED_AUTH,
            Self::ColumnEncryption => RequestedFeatures::COLUMN_ENCRYPTION,
            Self::GlobalTransactions => RequestedFeatures::GLOBAL_TRANSACTIONS,
            Self::AzureSqlSupport => RequestedFeatures::AZURE_SQL_SUPPORT,
            Self::DataClassification => RequestedFeatures::DATA_CLASSIFICATION,
            Self::Utf8Support => RequestedFeatures::UTF8_SUPPORT,
            Self::AzureSqlDnsCaching => RequestedFeatures::DNS_CACHING,
            Self::Json => RequestedFeatures::JSON,
            Self::Vector => RequestedFeatures::VECTOR,
            Self::EnhancedRouting => RequestedFeatures::ENHANCED_ROUTING,
            Self::Terminator => RequestedFeatures::empty(),
        }
    }
}

bitflags! {
    /// Feature extensions requested in LOGIN7.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestedFeatures: u16 {
        /// Session recovery, carrying the recovery snapshot on reconnect.
        const SESSION_RECOVERY = 0x0001;
        /// Federated authentication.
        const FED_AUTH = 0x0002;
        /// Column encryption.
        const COLUMN_ENCRYPTION = 0x0004;
        /// Global transactions.
        const GLOBAL_TRANSACTIONS = 0x0008;
        /// Azure SQL support.
        const AZURE_SQL_SUPPORT = 0x0010;
        /// Data classification.
        const DATA_CLASSIFICATION = 0x0020;
        /// UTF-8 support.
        const UTF8_SUPPORT = 0x0040;
        /// DNS caching.
        const DNS_CACHING = 0x0080;
        /// JSON type.
        const JSON = 0x0100;
        /// Vector type.
        const VECTOR = 0x0200;
        /// Enhanced routing.
        const ENHANCED_ROUTING = 0x0400;
    }
}

impl RequestedFeatures {
    /// Features requested on every login regardless of configuration.
    #[must_use]
    pub fn standard() -> Self {
        Self::SESSION_RECOVERY
            | Self::GLOBAL_TRANSACTIONS
            | Self::AZURE_SQL_SUPPORT
            | Self::DATA_CLASSIFICATION
            | Self::UTF8_SUPPORT
            | Self::DNS_CACHING
            | Self::JSON
            | Self::VECTOR
            | Self::ENHANCED_ROUTING
    }
}

/// Highest column-encryption version this client understands.
pub const MAX_SUPPORTED_TCE_VERSION: u8 = 3;

/// Highest data-classification version this client understands.
pub const MAX_SUPPORTED_DATA_CLASSIFICATION_VERSION: u8 = 2;

/// Highest JSON type version this client understands.
pub const MAX_SUPPORTED_JSON_VERSION: u8 = 1;

/// Highest vector type version this client understands.
pub const MAX_SUPPORTED_VECTOR_VERSION: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_known_and_unknown() {
        assert_eq!(FeatureId::from_u8(0x0D), Some(FeatureId::Json));
        assert_eq!(FeatureId::from_u8(0x0E), Some(FeatureId::Vector));
        assert_eq!(FeatureId::from_u8(0x03), None);
        assert_eq!(FeatureId::from_u8(0x42), None);
    }

    #[test]
    fn test_standard_requests_exclude_auth_and_encryption() {
        let standard = RequestedFeatures::standard();
        assert!(standard.contains(RequestedFeatures::SESSION_RECOVERY));
        assert!(!standard.contains(RequestedFeatures::FED_AUTH));
        assert!(!standard.contains(RequestedFeatures::COLUMN_ENCRYPTION));
    }

    #[test]
    fn test_request_flag_mapping() {
        assert_eq!(
            FeatureId::FedAuth.request_flag(),
            RequestedFeatures::FED_AUTH
        );
        assert!(FeatureId::Terminator.request_flag().is_empty());
    }
}
