//! Capability negotiation.
//!
//! [`CapabilitySet`] accumulates what the server acknowledged during login:
//! the protocol version from LOGINACK and the optional features from
//! FEATUREEXTACK. It starts empty, is filled in server order, and is
//! [`reset`](CapabilitySet::reset) before every new login attempt.
//!
//! Every known feature payload is validated in full before any field is
//! written, so a rejected acknowledgement leaves the set exactly as it was.

use crate::codec::utf16_from_bytes;
use crate::error::ProtocolError;
use crate::feature::{
    FeatureId, MAX_SUPPORTED_DATA_CLASSIFICATION_VERSION, MAX_SUPPORTED_JSON_VERSION,
    MAX_SUPPORTED_TCE_VERSION, MAX_SUPPORTED_VECTOR_VERSION, RequestedFeatures,
};
use crate::session_recovery::SessionRecoveryRecords;
use crate::token::LoginAck;
use crate::version::{ServerGeneration, TdsVersion};

/// Server product version from LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerVersion {
    /// Major version (16 for SQL Server 2022).
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Data classification negotiation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataClassification {
    /// The server did not acknowledge the feature.
    #[default]
    NotAcknowledged,
    /// Acknowledged but switched off on the server.
    Disabled,
    /// Enabled at the given version.
    Enabled {
        /// Negotiated version.
        version: u8,
    },
}

/// Per-connection capabilities negotiated during login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    requested: RequestedFeatures,
    protocol_version: Option<TdsVersion>,
    server_version: Option<ServerVersion>,
    server_name: String,
    session_recovery: bool,
    fed_auth: bool,
    utf8: bool,
    dns_caching: bool,
    data_classification: DataClassification,
    tce_version: Option<u8>,
    enclave_type: Option<String>,
    global_transactions_available: bool,
    global_transactions_enabled: bool,
    azure_sql: bool,
    read_only_failover: bool,
    json_version: Option<u8>,
    vector_version: Option<u8>,
    enhanced_routing: bool,
}

impl CapabilitySet {
    /// Create an empty set for a login that requested `requested`.
    #[must_use]
    pub fn new(requested: RequestedFeatures) -> Self {
        Self {
            requested,
            protocol_version: None,
            server_version: None,
            server_name: String::new(),
            session_recovery: false,
            fed_auth: false,
            utf8: false,
            dns_caching: false,
            data_classification: DataClassification::NotAcknowledged,
            tce_version: None,
            enclave_type: None,
            global_transactions_available: false,
            global_transactions_enabled: false,
            azure_sql: false,
            read_only_failover: false,
            json_version: None,
            vector_version: None,
            enhanced_routing: false,
        }
    }

    /// Forget everything negotiated so far, keeping the request set.
    pub fn reset(&mut self) {
        *self = Self::new(self.requested);
    }

    /// Record LOGINACK after checking its protocol version.
    pub fn process_login_ack(&mut self, ack: &LoginAck) -> Result<ServerGeneration, ProtocolError> {
        let generation = ack.tds_version.validate_login_ack()?;
        self.protocol_version = Some(ack.tds_version);
        self.server_version = Some(ack.server_version);
        self.server_name.clone_from(&ack.prog_name);
        tracing::debug!(
            tds_version = %ack.tds_version,
            server_version = %ack.server_version,
            "login acknowledged"
        );
        Ok(generation)
    }

    /// Validate and apply one feature acknowledgement.
    ///
    /// Unknown feature ids are ignored. A known feature with a malformed
    /// payload fails without changing the set.
    pub fn process_feature_ack(&mut self, feature_id: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let Some(feature) = FeatureId::from_u8(feature_id) else {
            tracing::debug!(feature_id, len = payload.len(), "ignoring unknown feature ack");
            return Ok(());
        };

        match feature {
            FeatureId::SessionRecovery => {
                self.require_requested(feature)?;
                for record in SessionRecoveryRecords::new(payload) {
                    record?;
                }
                self.session_recovery = true;
            }
            FeatureId::FedAuth => {
                self.require_requested(feature)?;
                if !payload.is_empty() {
                    return Err(ProtocolError::MalformedFeatureAck {
                        feature_id,
                        reason: "unexpected data for token-based workflow",
                    });
                }
                self.fed_auth = true;
            }
            FeatureId::ColumnEncryption => {
                require_min(feature, payload, 1)?;
                let version = payload[0];
                if version == 0 || version > MAX_SUPPORTED_TCE_VERSION {
                    return Err(invalid_version(feature, version));
                }
                // Byte 1 is a length prefix; the enclave type string follows it.
                let enclave_type = match payload.get(2..) {
                    Some(name) if !name.is_empty() => Some(utf16_from_bytes(name).map_err(|_| {
                        ProtocolError::MalformedFeatureAck {
                            feature_id,
                            reason: "enclave type is not valid UTF-16",
                        }
                    })?),
                    _ => None,
                };
                self.tce_version = Some(version);
                self.enclave_type = enclave_type;
            }
            FeatureId::GlobalTransactions => {
                require_min(feature, payload, 1)?;
                self.global_transactions_available = true;
                self.global_transactions_enabled = payload[0] == 1;
            }
            FeatureId::AzureSqlSupport => {
                require_min(feature, payload, 1)?;
                self.azure_sql = true;
                self.read_only_failover = payload[0] & 0x01 != 0;
            }
            FeatureId::DataClassification => {
                require_exact(feature, payload, 2)?;
                let (version, enabled) = (payload[0], payload[1] != 0);
                self.data_classification = if !enabled {
                    DataClassification::Disabled
                } else if version == 0 || version > MAX_SUPPORTED_DATA_CLASSIFICATION_VERSION {
                    return Err(invalid_version(feature, version));
                } else {
                    DataClassification::Enabled { version }
                };
            }
            FeatureId::Utf8Support => {
                require_min(feature, payload, 1)?;
                self.utf8 = payload[0] & 0x01 != 0;
            }
            FeatureId::AzureSqlDnsCaching => {
                require_min(feature, payload, 1)?;
                self.dns_caching = payload[0] & 0x01 != 0;
            }
            FeatureId::Json => {
                self.json_version = versioned_type(feature, payload, MAX_SUPPORTED_JSON_VERSION)?;
            }
            FeatureId::Vector => {
                self.vector_version =
                    versioned_type(feature, payload, MAX_SUPPORTED_VECTOR_VERSION)?;
            }
            FeatureId::EnhancedRouting => {
                require_exact(feature, payload, 1)?;
                self.enhanced_routing = payload[0] == 1;
            }
            FeatureId::Terminator => {
                return Err(ProtocolError::MalformedFeatureAck {
                    feature_id,
                    reason: "terminator inside acknowledgement list",
                });
            }
        }

        tracing::debug!(feature = feature.name(), "feature acknowledged");
        Ok(())
    }

    fn require_requested(&self, feature: FeatureId) -> Result<(), ProtocolError> {
        if self.requested.contains(feature.request_flag()) {
            Ok(())
        } else {
            Err(ProtocolError::UnrequestedFeature(feature as u8))
        }
    }

    /// Features requested in LOGIN7.
    #[must_use]
    pub fn requested(&self) -> RequestedFeatures {
        self.requested
    }

    /// Negotiated protocol version, once LOGINACK has been processed.
    #[must_use]
    pub fn protocol_version(&self) -> Option<TdsVersion> {
        self.protocol_version
    }

    /// Server product version.
    #[must_use]
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.server_version
    }

    /// Server program name from LOGINACK.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Server generation derived from the protocol version.
    #[must_use]
    pub fn generation(&self) -> Option<ServerGeneration> {
        self.protocol_version.and_then(TdsVersion::server_generation)
    }

    /// SQL Server 2005 or newer.
    #[must_use]
    pub fn is_2005_or_newer(&self) -> bool {
        self.generation() >= Some(ServerGeneration::Sql2005)
    }

    /// SQL Server 2008 or newer.
    #[must_use]
    pub fn is_2008_or_newer(&self) -> bool {
        self.generation() >= Some(ServerGeneration::Sql2008)
    }

    /// SQL Server 2012 or newer.
    #[must_use]
    pub fn is_2012_or_newer(&self) -> bool {
        self.generation() >= Some(ServerGeneration::Sql2012)
    }

    /// SQL Server 2022 (TDS 8.0) or newer.
    #[must_use]
    pub fn is_2022_or_newer(&self) -> bool {
        self.generation() >= Some(ServerGeneration::Sql2022)
    }

    /// The server acknowledged session recovery.
    #[must_use]
    pub fn session_recovery_acknowledged(&self) -> bool {
        self.session_recovery
    }

    /// The server acknowledged federated authentication.
    #[must_use]
    pub fn fed_auth_acknowledged(&self) -> bool {
        self.fed_auth
    }

    /// UTF-8 collations are supported.
    #[must_use]
    pub fn utf8_supported(&self) -> bool {
        self.utf8
    }

    /// The server allows client-side DNS caching.
    #[must_use]
    pub fn dns_caching_supported(&self) -> bool {
        self.dns_caching
    }

    /// Data classification state.
    #[must_use]
    pub fn data_classification(&self) -> DataClassification {
        self.data_classification
    }

    /// Negotiated column-encryption version.
    #[must_use]
    pub fn column_encryption_version(&self) -> Option<u8> {
        self.tce_version
    }

    /// Enclave type announced alongside column encryption.
    #[must_use]
    pub fn enclave_type(&self) -> Option<&str> {
        self.enclave_type.as_deref()
    }

    /// Global transactions are available on this server.
    #[must_use]
    pub fn global_transactions_available(&self) -> bool {
        self.global_transactions_available
    }

    /// Global transactions are enabled for this database.
    #[must_use]
    pub fn global_transactions_enabled(&self) -> bool {
        self.global_transactions_enabled
    }

    /// The server is Azure SQL.
    #[must_use]
    pub fn is_azure_sql(&self) -> bool {
        self.azure_sql
    }

    /// A read-only failover partner may be used with `ApplicationIntent=ReadOnly`.
    #[must_use]
    pub fn read_only_failover_supported(&self) -> bool {
        self.read_only_failover
    }

    /// Negotiated JSON type version; `None` when unsupported.
    #[must_use]
    pub fn json_version(&self) -> Option<u8> {
        self.json_version
    }

    /// Negotiated vector type version; `None` when unsupported.
    #[must_use]
    pub fn vector_version(&self) -> Option<u8> {
        self.vector_version
    }

    /// Enhanced routing is enabled.
    #[must_use]
    pub fn enhanced_routing(&self) -> bool {
        self.enhanced_routing
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::new(RequestedFeatures::standard())
    }
}

fn require_min(feature: FeatureId, payload: &[u8], min: usize) -> Result<(), ProtocolError> {
    if payload.len() < min {
        return Err(ProtocolError::FeatureAckLength {
            feature_id: feature as u8,
            expected: min,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn require_exact(feature: FeatureId, payload: &[u8], len: usize) -> Result<(), ProtocolError> {
    if payload.len() != len {
        return Err(ProtocolError::FeatureAckLength {
            feature_id: feature as u8,
            expected: len,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn invalid_version(feature: FeatureId, version: u8) -> ProtocolError {
    ProtocolError::InvalidVersion {
        feature: feature.name(),
        version,
    }
}

/// One-byte version where zero means "not supported".
fn versioned_type(feature: FeatureId, payload: &[u8], max: u8) -> Result<Option<u8>, ProtocolError> {
    require_exact(feature, payload, 1)?;
    match payload[0] {
        0 => Ok(None),
        v if v > max => Err(invalid_version(feature, v)),
        v => Ok(Some(v)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn login_ack(version: TdsVersion) -> LoginAck {
        LoginAck {
            interface: 1,
            tds_version: version,
            prog_name: "Microsoft SQL Server".into(),
            server_version: ServerVersion {
                major: 16,
                minor: 0,
                build: 4105,
            },
        }
    }

    fn all_requested() -> CapabilitySet {
        CapabilitySet::new(RequestedFeatures::all())
    }

    #[test]
    fn test_json_zero_is_absent() {
        let mut caps = all_requested();
        caps.process_feature_ack(FeatureId::Json as u8, &[0x00]).unwrap();
        assert_eq!(caps.json_version(), None);
    }

    #[test]
    fn test_json_supported_and_too_new() {
        let mut caps = all_requested();
        caps.process_feature_ack(FeatureId::Json as u8, &[0x01]).unwrap();
        assert_eq!(caps.json_version(), Some(1));

        let err = caps
            .process_feature_ack(FeatureId::Json as u8, &[0x02])
            .unwrap_err();
        assert!(err.is_version_error());
        assert_eq!(caps.json_version(), Some(1));
    }

    #[test]
    fn test_vector_empty_payload_is_violation() {
        let mut caps = all_requested();
        let before = caps.clone();
        let err = caps
            .process_feature_ack(FeatureId::Vector as u8, &[])
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::FeatureAckLength {
                feature_id: 0x0E,
                expected: 1,
                actual: 0
            }
        );
        assert_eq!(caps, before);
    }

    #[test]
    fn test_data_classification() {
        let mut caps = all_requested();
        caps.process_feature_ack(FeatureId::DataClassification as u8, &[2, 1])
            .unwrap();
        assert_eq!(
            caps.data_classification(),
            DataClassification::Enabled { version: 2 }
        );

        caps.process_feature_ack(FeatureId::DataClassification as u8, &[0, 0])
            .unwrap();
        assert_eq!(caps.data_classification(), DataClassification::Disabled);

        // The version is only checked when the server reports it enabled.
        caps.process_feature_ack(FeatureId::DataClassification as u8, &[200, 0])
            .unwrap();
        assert_eq!(caps.data_classification(), DataClassification::Disabled);

        for version in [0u8, 3, 200] {
            let err = caps
                .process_feature_ack(FeatureId::DataClassification as u8, &[version, 1])
                .unwrap_err();
            assert_eq!(
                err,
                ProtocolError::InvalidVersion {
                    feature: "data classification",
                    version
                }
            );
        }
        assert_eq!(caps.data_classification(), DataClassification::Disabled);

        let err = caps
            .process_feature_ack(FeatureId::DataClassification as u8, &[1])
            .unwrap_err();
        assert!(err.is_violation());
    }

    #[test]
    fn test_column_encryption_with_enclave() {
        let mut caps = all_requested();
        let mut payload = vec![2, 3];
        payload.extend("VBS".encode_utf16().flat_map(u16::to_le_bytes));
        caps.process_feature_ack(FeatureId::ColumnEncryption as u8, &payload)
            .unwrap();
        assert_eq!(caps.column_encryption_version(), Some(2));
        assert_eq!(caps.enclave_type(), Some("VBS"));
    }

    #[test]
    fn test_column_encryption_rejects_bad_version_and_odd_string() {
        let mut caps = all_requested();
        assert!(
            caps.process_feature_ack(FeatureId::ColumnEncryption as u8, &[4])
                .unwrap_err()
                .is_version_error()
        );
        assert!(
            caps.process_feature_ack(FeatureId::ColumnEncryption as u8, &[1, 1, b'V'])
                .unwrap_err()
                .is_violation()
        );
        assert_eq!(caps.column_encryption_version(), None);
    }

    #[test]
    fn test_bitfield_features() {
        let mut caps = all_requested();
        caps.process_feature_ack(FeatureId::Utf8Support as u8, &[0x01]).unwrap();
        caps.process_feature_ack(FeatureId::AzureSqlDnsCaching as u8, &[0x02])
            .unwrap();
        caps.process_feature_ack(FeatureId::AzureSqlSupport as u8, &[0x01])
            .unwrap();
        caps.process_feature_ack(FeatureId::GlobalTransactions as u8, &[0x00])
            .unwrap();
        caps.process_feature_ack(FeatureId::EnhancedRouting as u8, &[0x01])
            .unwrap();

        assert!(caps.utf8_supported());
        assert!(!caps.dns_caching_supported());
        assert!(caps.is_azure_sql());
        assert!(caps.read_only_failover_supported());
        assert!(caps.global_transactions_available());
        assert!(!caps.global_transactions_enabled());
        assert!(caps.enhanced_routing());
    }

    #[test]
    fn test_unknown_feature_is_ignored() {
        let mut caps = all_requested();
        let before = caps.clone();
        caps.process_feature_ack(0x42, &[1, 2, 3]).unwrap();
        caps.process_feature_ack(0x03, &[]).unwrap();
        assert_eq!(caps, before);
    }

    #[test]
    fn test_unrequested_session_recovery_and_fed_auth() {
        let mut caps = CapabilitySet::new(RequestedFeatures::JSON);
        assert_eq!(
            caps.process_feature_ack(FeatureId::SessionRecovery as u8, &[]),
            Err(ProtocolError::UnrequestedFeature(0x01))
        );
        assert_eq!(
            caps.process_feature_ack(FeatureId::FedAuth as u8, &[]),
            Err(ProtocolError::UnrequestedFeature(0x02))
        );
    }

    #[test]
    fn test_session_recovery_framing_is_checked() {
        let mut caps = all_requested();
        assert!(
            caps.process_feature_ack(FeatureId::SessionRecovery as u8, &[1, 5, 0])
                .is_err()
        );
        assert!(!caps.session_recovery_acknowledged());

        caps.process_feature_ack(FeatureId::SessionRecovery as u8, &[1, 1, 0])
            .unwrap();
        assert!(caps.session_recovery_acknowledged());
    }

    #[test]
    fn test_fed_auth_rejects_extra_data() {
        let mut caps = all_requested();
        assert!(
            caps.process_feature_ack(FeatureId::FedAuth as u8, &[0; 32])
                .is_err()
        );
        caps.process_feature_ack(FeatureId::FedAuth as u8, &[]).unwrap();
        assert!(caps.fed_auth_acknowledged());
    }

    #[test]
    fn test_login_ack_tiers() {
        let mut caps = all_requested();
        assert!(!caps.is_2005_or_newer());

        caps.process_login_ack(&login_ack(TdsVersion::V7_4)).unwrap();
        assert!(caps.is_2005_or_newer());
        assert!(caps.is_2008_or_newer());
        assert!(caps.is_2012_or_newer());
        assert!(!caps.is_2022_or_newer());

        caps.process_login_ack(&login_ack(TdsVersion::V8_0)).unwrap();
        assert!(caps.is_2022_or_newer());

        caps.process_login_ack(&login_ack(TdsVersion::V7_2)).unwrap();
        assert!(caps.is_2005_or_newer());
        assert!(!caps.is_2008_or_newer());
    }

    #[test]
    fn test_login_ack_rejects_unlisted_version() {
        let mut caps = all_requested();
        let err = caps
            .process_login_ack(&login_ack(TdsVersion::V7_3A))
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidProtocolVersion(0x730A0003));
        assert_eq!(caps.protocol_version(), None);
    }

    #[test]
    fn test_reset_keeps_requests() {
        let mut caps = CapabilitySet::new(RequestedFeatures::FED_AUTH);
        caps.process_feature_ack(FeatureId::FedAuth as u8, &[]).unwrap();
        caps.process_login_ack(&login_ack(TdsVersion::V7_4)).unwrap();
        caps.reset();
        assert_eq!(caps, CapabilitySet::new(RequestedFeatures::FED_AUTH));
    }

    /// Minimum payload length of each fixed-layout feature.
    const MIN_LENGTHS: &[(FeatureId, usize)] = &[
        (FeatureId::ColumnEncryption, 1),
        (FeatureId::GlobalTransactions, 1),
        (FeatureId::AzureSqlSupport, 1),
        (FeatureId::DataClassification, 2),
        (FeatureId::Utf8Support, 1),
        (FeatureId::AzureSqlDnsCaching, 1),
        (FeatureId::Json, 1),
        (FeatureId::Vector, 1),
        (FeatureId::EnhancedRouting, 1),
    ];

    proptest! {
        #[test]
        fn short_payloads_never_mutate(
            index in 0..MIN_LENGTHS.len(),
            bytes in proptest::collection::vec(any::<u8>(), 0..2),
        ) {
            let (feature, min) = MIN_LENGTHS[index];
            let payload = &bytes[..bytes.len().min(min - 1)];

            let mut caps = all_requested();
            caps.process_login_ack(&login_ack(TdsVersion::V7_4)).unwrap();
            let before = caps.clone();

            let err = caps.process_feature_ack(feature as u8, payload).unwrap_err();
            let is_length_error = matches!(err, ProtocolError::FeatureAckLength { .. });
            prop_assert!(is_length_error);
            prop_assert_eq!(caps, before);
        }

        #[test]
        fn rejected_acks_leave_set_untouched(
            feature_id in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let mut caps = all_requested();
            let before = caps.clone();
            if caps.process_feature_ack(feature_id, &payload).is_err() {
                prop_assert_eq!(caps, before);
            }
        }
    }
}
