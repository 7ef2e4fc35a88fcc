//! Session state capture and replay.
//!
//! Every connection keeps a [`SessionState`]: the database, language and
//! collation the session started with, the opaque state slots the server
//! reported through the session-recovery feature, and the deltas it has
//! reported since through SESSIONSTATE tokens. When the connection breaks,
//! [`SessionState::for_recovery`] derives a fresh copy from the initial
//! baseline and [`SessionState::encode_recovery_request`] serializes what
//! the new login must replay.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::codec::write_b_varchar;
use tds_protocol::session_recovery::write_state_record;
use tds_protocol::{
    Collation, MAX_STATE_SLOTS, ProtocolError, SessionRecoveryRecord, SessionRecoveryRecords,
    TdsVersion,
};

use crate::server_identity::AliasCache;

/// Sequence number the server sends once it stops tracking session state.
const UNTRACKED_SEQUENCE: u32 = u32::MAX;

/// A state slot changed after the session opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateRecord {
    /// Whether the slot can be replayed on a new connection.
    pub recoverable: bool,
    /// Sequence number of the token that last wrote the slot.
    pub version: u32,
    /// Opaque slot data.
    pub data: Bytes,
}

/// Point-in-time view of the session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current database.
    pub database: Option<String>,
    /// Current language.
    pub language: Option<String>,
    /// Current collation.
    pub collation: Option<Collation>,
    /// Negotiated protocol version.
    pub protocol_version: Option<TdsVersion>,
    /// Whether the connection is encrypted.
    pub encrypted: bool,
    /// Whether all changed state can be replayed on reconnect.
    pub recoverable: bool,
}

/// Session-scoped server state of one logical session.
#[derive(Debug, Clone)]
pub struct SessionState {
    initial_database: Option<String>,
    initial_language: Option<String>,
    initial_collation: Option<Collation>,
    protocol_version: Option<TdsVersion>,
    encrypted: bool,
    resolved_aliases: AliasCache,
    initial_state: Vec<Option<Bytes>>,
    delta: Vec<Option<SessionStateRecord>>,

    database: Option<String>,
    language: Option<String>,
    collation: Option<Collation>,

    unrecoverable_count: usize,
    delta_dirty: bool,
    recovering: bool,
    poolable: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Create an empty state for a first login.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_database: None,
            initial_language: None,
            initial_collation: None,
            protocol_version: None,
            encrypted: false,
            resolved_aliases: AliasCache::new(),
            initial_state: vec![None; MAX_STATE_SLOTS],
            delta: vec![None; MAX_STATE_SLOTS],
            database: None,
            language: None,
            collation: None,
            unrecoverable_count: 0,
            delta_dirty: false,
            recovering: false,
            poolable: true,
        }
    }

    /// Derive the state a reconnect starts from.
    ///
    /// Only the initial baseline and the resolved aliases carry over; the
    /// deltas of the broken session are replayed through
    /// [`encode_recovery_request`](Self::encode_recovery_request) on `self`
    /// and then reported again by the server.
    #[must_use]
    pub fn for_recovery(&self) -> Self {
        Self {
            initial_database: self.initial_database.clone(),
            initial_language: self.initial_language.clone(),
            initial_collation: self.initial_collation,
            protocol_version: self.protocol_version,
            encrypted: self.encrypted,
            resolved_aliases: self.resolved_aliases.clone(),
            initial_state: self.initial_state.clone(),
            recovering: true,
            ..Self::new()
        }
    }

    /// Record the session-recovery feature acknowledgement.
    ///
    /// On a first login the slots populate the initial baseline. During
    /// recovery they arrive as recoverable deltas.
    pub fn record(&mut self, feature_data: &[u8]) -> Result<(), ProtocolError> {
        let records = SessionRecoveryRecords::new(feature_data).collect::<Result<Vec<_>, _>>()?;

        for SessionRecoveryRecord { slot, data } in records {
            let slot = usize::from(slot);
            if self.recovering {
                if let Some(previous) = &self.delta[slot] {
                    if !previous.recoverable {
                        self.unrecoverable_count -= 1;
                    }
                }
                self.delta[slot] = Some(SessionStateRecord {
                    recoverable: true,
                    version: 0,
                    data,
                });
                self.delta_dirty = true;
            } else {
                self.initial_state[slot] = Some(data);
            }
        }

        tracing::debug!(
            recovering = self.recovering,
            len = feature_data.len(),
            "recorded session recovery acknowledgement"
        );
        self.check_counter();
        Ok(())
    }

    /// Apply a SESSIONSTATE token.
    ///
    /// A slot is overwritten only by a token whose sequence number is not
    /// older than the one that last wrote it.
    pub fn apply_state_token(
        &mut self,
        sequence: u32,
        recoverable: bool,
        records: &[SessionRecoveryRecord],
    ) {
        if sequence == UNTRACKED_SEQUENCE {
            tracing::debug!("server stopped tracking session state; connection is not poolable");
            self.poolable = false;
        }

        for record in records {
            let slot = &mut self.delta[usize::from(record.slot)];
            match slot {
                None => {
                    if !recoverable {
                        self.unrecoverable_count += 1;
                    }
                    *slot = Some(SessionStateRecord {
                        recoverable,
                        version: sequence,
                        data: record.data.clone(),
                    });
                }
                Some(existing) if existing.version <= sequence => {
                    if existing.recoverable != recoverable {
                        if recoverable {
                            self.unrecoverable_count -= 1;
                        } else {
                            self.unrecoverable_count += 1;
                        }
                        existing.recoverable = recoverable;
                    }
                    existing.version = sequence;
                    existing.data = record.data.clone();
                }
                Some(_) => {}
            }
        }
        self.delta_dirty = true;
        self.check_counter();
    }

    /// Apply a reset-connection acknowledgement.
    ///
    /// Clears the current settings and any deltas. The initial baseline is
    /// never touched.
    pub fn reset(&mut self) {
        self.database = None;
        self.language = None;
        self.collation = None;
        if self.delta_dirty {
            self.delta.iter_mut().for_each(|slot| *slot = None);
            self.delta_dirty = false;
            self.unrecoverable_count = 0;
        }
        self.check_counter();
    }

    /// Capture the current settings as the initial baseline.
    ///
    /// Called once, after the first successful login.
    pub fn snapshot_initial(&mut self) {
        self.initial_database.clone_from(&self.database);
        self.initial_language.clone_from(&self.language);
        self.initial_collation = self.collation;
    }

    /// Leave recovery mode after the reconnect completed.
    pub fn finish_recovery(&mut self) {
        self.recovering = false;
    }

    /// Whether every changed slot can be replayed on a new connection.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.unrecoverable_count == 0
    }

    /// Whether the connection may be returned to a pool.
    #[must_use]
    pub fn is_poolable(&self) -> bool {
        self.poolable
    }

    /// Whether this state belongs to a recovery login.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Serialize the session-recovery feature data for a reconnect.
    ///
    /// Layout: `u32` total length, then the initial part and the current
    /// part, each prefixed with its own `u32` length. The current part only
    /// carries settings that differ from the initial baseline.
    #[must_use]
    pub fn encode_recovery_request(&self) -> Bytes {
        let mut initial = BytesMut::new();
        write_b_varchar(&mut initial, self.initial_database.as_deref().unwrap_or(""));
        write_collation(&mut initial, self.initial_collation.as_ref());
        write_b_varchar(&mut initial, self.initial_language.as_deref().unwrap_or(""));
        for (slot, data) in self.initial_state.iter().enumerate() {
            if let Some(data) = data {
                write_state_record(&mut initial, slot as u8, data);
            }
        }

        let mut current = BytesMut::new();
        write_b_varchar(
            &mut current,
            changed(&self.database, &self.initial_database).unwrap_or(""),
        );
        let collation = self
            .collation
            .as_ref()
            .filter(|c| Some(**c) != self.initial_collation);
        write_collation(&mut current, collation);
        write_b_varchar(
            &mut current,
            changed(&self.language, &self.initial_language).unwrap_or(""),
        );
        for (slot, record) in self.delta.iter().enumerate() {
            let Some(record) = record else { continue };
            if !record.recoverable {
                continue;
            }
            if self.initial_state[slot].as_ref() == Some(&record.data) {
                continue;
            }
            write_state_record(&mut current, slot as u8, &record.data);
        }

        let mut out = BytesMut::with_capacity(12 + initial.len() + current.len());
        out.put_u32_le((8 + initial.len() + current.len()) as u32);
        out.put_u32_le(initial.len() as u32);
        out.extend_from_slice(&initial);
        out.put_u32_le(current.len() as u32);
        out.extend_from_slice(&current);
        out.freeze()
    }

    /// Current view of the session settings.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            database: self.database.clone(),
            language: self.language.clone(),
            collation: self.collation,
            protocol_version: self.protocol_version,
            encrypted: self.encrypted,
            recoverable: self.is_recoverable(),
        }
    }

    /// Set the current database.
    pub fn set_database(&mut self, database: impl Into<String>) {
        self.database = Some(database.into());
    }

    /// Set the current language.
    pub fn set_language(&mut self, language: impl Into<String>) {
        self.language = Some(language.into());
    }

    /// Set the current collation.
    pub fn set_collation(&mut self, collation: Collation) {
        self.collation = Some(collation);
    }

    /// Set the negotiated protocol version.
    pub fn set_protocol_version(&mut self, version: TdsVersion) {
        self.protocol_version = Some(version);
    }

    /// Mark the connection as encrypted or not.
    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Current language.
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Current collation.
    #[must_use]
    pub fn collation(&self) -> Option<Collation> {
        self.collation
    }

    /// Database the session started in.
    #[must_use]
    pub fn initial_database(&self) -> Option<&str> {
        self.initial_database.as_deref()
    }

    /// Language the session started with.
    #[must_use]
    pub fn initial_language(&self) -> Option<&str> {
        self.initial_language.as_deref()
    }

    /// Collation the session started with.
    #[must_use]
    pub fn initial_collation(&self) -> Option<Collation> {
        self.initial_collation
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn protocol_version(&self) -> Option<TdsVersion> {
        self.protocol_version
    }

    /// Whether the connection is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Initial value of a state slot.
    #[must_use]
    pub fn initial_slot(&self, slot: u8) -> Option<&Bytes> {
        self.initial_state[usize::from(slot)].as_ref()
    }

    /// Changed value of a state slot.
    #[must_use]
    pub fn delta_slot(&self, slot: u8) -> Option<&SessionStateRecord> {
        self.delta[usize::from(slot)].as_ref()
    }

    /// Number of state slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.initial_state.len()
    }

    /// Alias resolutions made for this session.
    pub fn resolved_aliases_mut(&mut self) -> &mut AliasCache {
        &mut self.resolved_aliases
    }

    /// Alias resolutions made for this session.
    #[must_use]
    pub fn resolved_aliases(&self) -> &AliasCache {
        &self.resolved_aliases
    }

    fn check_counter(&self) {
        debug_assert_eq!(
            self.unrecoverable_count,
            self.delta
                .iter()
                .flatten()
                .filter(|record| !record.recoverable)
                .count(),
            "unrecoverable delta counter out of sync"
        );
    }
}

fn changed<'a>(current: &'a Option<String>, initial: &Option<String>) -> Option<&'a str> {
    current.as_deref().filter(|c| Some(*c) != initial.as_deref())
}

fn write_collation(dst: &mut BytesMut, collation: Option<&Collation>) {
    match collation {
        Some(collation) => {
            dst.put_u8(Collation::SIZE as u8);
            collation.encode(dst);
        }
        None => dst.put_u8(0),
    }
}
