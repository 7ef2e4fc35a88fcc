//! # tds-protocol
//!
//! Control-plane records of the MS-TDS (Tabular Data Stream) protocol used by
//! Microsoft SQL Server during connection establishment.
//!
//! The crate decodes the records a server sends in response to PRELOGIN and
//! LOGIN7 (login acknowledgement, environment changes, feature-extension
//! acknowledgements, errors, session state, federated-auth info) and folds
//! them into a per-connection [`CapabilitySet`].
//!
//! ## Design Philosophy
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic and
//! makes no assumptions about the async runtime. Framing is handled by the
//! transport; every decoder here takes the token body that follows the token
//! type byte.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{CapabilitySet, FeatureId, RequestedFeatures};
//!
//! let mut caps = CapabilitySet::new(RequestedFeatures::JSON);
//! caps.process_feature_ack(FeatureId::Json as u8, &[0x00]).unwrap();
//! assert_eq!(caps.json_version(), None);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod capability;
pub mod codec;
pub mod error;
pub mod feature;
pub mod session_recovery;
pub mod token;
pub mod version;

pub use capability::{CapabilitySet, DataClassification, ServerVersion};
pub use error::ProtocolError;
pub use feature::{FeatureId, RequestedFeatures};
pub use session_recovery::{SessionRecoveryRecord, SessionRecoveryRecords, MAX_STATE_SLOTS};
pub use token::{
    Collation, Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue, FeatureAck,
    FeatureExtAck, FedAuthInfo, LoginAck, RoutingInfo, ServerError, SessionStateToken, TokenType,
};
pub use version::{ServerGeneration, TdsVersion};
