//! Connections and the sessions they own.
//!
//! A [`Connection`] is the owner: it holds the only strong reference to its
//! [`ConnectionShared`] state. The [`Session`] it hands out to the command
//! layer points back at the owner through a `Weak`, so a session whose
//! connection is gone reports itself closed instead of keeping it alive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tds_protocol::{CapabilitySet, EnvChange};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::lock::{ExclusiveAccessLock, LockError};
use crate::orchestrator::{ConnectionAttempt, ConnectionOrchestrator, EstablishedSession};
use crate::pool::PoolGroupContext;
use crate::server_identity::ServerIdentity;
use crate::session_state::{SessionSnapshot, SessionState};
use crate::transport::{Connector, Transport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between a connection and its session.
#[derive(Debug)]
pub struct ConnectionShared {
    id: u64,
    lock: Arc<ExclusiveAccessLock>,
    doomed: AtomicBool,
    closed: AtomicBool,
}

impl Default for ConnectionShared {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionShared {
    /// Create state for a new, not yet logged-in connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            lock: ExclusiveAccessLock::new(),
            doomed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Connection id, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The lock serializing access to the wire session.
    #[must_use]
    pub fn lock(&self) -> &Arc<ExclusiveAccessLock> {
        &self.lock
    }

    /// Mark the connection unusable.
    pub fn doom(&self) {
        if !self.doomed.swap(true, Ordering::AcqRel) {
            tracing::warn!(connection_id = self.id, "connection doomed");
        }
    }

    /// Clear the doomed flag.
    pub fn clear_doomed(&self) {
        self.doomed.store(false, Ordering::Release);
    }

    /// Whether the connection has been marked unusable.
    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The internal session: an open transport plus everything the login negotiated.
pub struct Session {
    owner: Weak<ConnectionShared>,
    transport: Box<dyn Transport>,
    identity: ServerIdentity,
    capabilities: CapabilitySet,
    state: SessionState,
    packet_size: u32,
    mars: bool,
    failover_partner: Option<String>,
    user_instance: Option<String>,
    live_result_sets: usize,
    transaction_events: Vec<EnvChange>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("packet_size", &self.packet_size)
            .field("mars", &self.mars)
            .field("live_result_sets", &self.live_result_sets)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap an established login for the connection `owner`.
    #[must_use]
    pub fn new(owner: Weak<ConnectionShared>, established: EstablishedSession, mars: bool) -> Self {
        Self {
            owner,
            transport: established.transport,
            identity: established.identity,
            capabilities: established.capabilities,
            state: established.session,
            packet_size: established.packet_size,
            mars,
            failover_partner: established.failover_partner,
            user_instance: established.user_instance,
            live_result_sets: 0,
            transaction_events: established.transaction_events,
        }
    }

    /// Check that a new request may be sent.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the owning connection is gone, closed
    ///   or its transport is dead.
    /// - [`Error::NotReady`] if the connection is doomed, another result set
    ///   is still open without MARS, or unread data is pending.
    pub fn validate_ready_for_execute(&self) -> Result<()> {
        let owner = self.owner.upgrade().ok_or(Error::ConnectionClosed)?;
        if owner.is_closed() || !self.transport.is_alive() {
            return Err(Error::ConnectionClosed);
        }
        if owner.is_doomed() {
            return Err(Error::NotReady("connection is broken"));
        }
        if self.live_result_sets > 0 && !self.mars {
            return Err(Error::NotReady("another result set is still open"));
        }
        if self.transport.has_pending_data() {
            return Err(Error::NotReady("unread data is pending"));
        }
        Ok(())
    }

    /// Current session settings.
    #[must_use]
    pub fn current_session_snapshot(&self) -> SessionSnapshot {
        self.state.snapshot()
    }

    /// Drain the transaction environment changes seen so far.
    pub fn take_transaction_events(&mut self) -> Vec<EnvChange> {
        std::mem::take(&mut self.transaction_events)
    }

    /// Note that a result set started streaming.
    pub fn begin_result_set(&mut self) {
        self.live_result_sets += 1;
    }

    /// Note that a result set finished.
    pub fn end_result_set(&mut self) {
        self.live_result_sets = self.live_result_sets.saturating_sub(1);
    }

    /// Identity that accepted the login.
    #[must_use]
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Negotiated capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Session state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Session state, for applying records read by the command layer.
    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Failover partner advertised by the server.
    #[must_use]
    pub fn failover_partner(&self) -> Option<&str> {
        self.failover_partner.as_deref()
    }

    /// User instance the server started.
    #[must_use]
    pub fn user_instance(&self) -> Option<&str> {
        self.user_instance.as_deref()
    }

    /// Whether the connection may go back to a pool.
    #[must_use]
    pub fn is_poolable(&self) -> bool {
        self.state.is_poolable()
    }

    /// The underlying transport.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }
}

/// A connection to SQL Server: owner of one session.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    config: Arc<Config>,
    orchestrator: ConnectionOrchestrator,
    session: Session,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection with a private token cache.
    ///
    /// # Errors
    ///
    /// Returns the login error if no attempt succeeded.
    pub async fn connect(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::open(config, connector, None).await
    }

    /// Open a connection belonging to a pool group.
    ///
    /// # Errors
    ///
    /// Returns the login error if no attempt succeeded.
    pub async fn connect_pooled(
        config: Config,
        connector: Arc<dyn Connector>,
        pool: Arc<PoolGroupContext>,
    ) -> Result<Self> {
        Self::open(config, connector, Some(pool)).await
    }

    async fn open(
        config: Config,
        connector: Arc<dyn Connector>,
        pool: Option<Arc<PoolGroupContext>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let shared = Arc::new(ConnectionShared::new());
        let mut orchestrator = ConnectionOrchestrator::new(Arc::clone(&config), connector, pool);

        let permit = shared.lock.acquire_async(true).await;
        let mut established = orchestrator.login(&shared, None).await?;
        established.session.snapshot_initial();
        let session = Session::new(Arc::downgrade(&shared), established, config.mars);
        shared.lock.release(permit).map_err(LockError::from)?;

        tracing::debug!(connection_id = shared.id, server = %session.identity, "connection opened");
        Ok(Self {
            shared,
            config,
            orchestrator,
            session,
        })
    }

    /// Reconnect a broken session, replaying its state on a new connection.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotRecoverable`] if recovery is disabled or the
    ///   session holds state that cannot be replayed.
    /// - The last login error once every retry failed.
    pub async fn recover(&mut self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let retries = self.config.retry.connect_retry_count;
        if retries == 0 || !self.session.state.is_recoverable() {
            return Err(Error::SessionNotRecoverable);
        }

        let permit = self.shared.lock.acquire_async(true).await;
        let previous = self.session.state.clone();
        let mut last_error = None;

        for attempt in 1..=retries {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry.connect_retry_interval).await;
            }
            match self.orchestrator.login(&self.shared, Some(&previous)).await {
                Ok(mut established) => {
                    established.session.finish_recovery();
                    let stale = std::mem::replace(
                        &mut self.session,
                        Session::new(Arc::downgrade(&self.shared), established, self.config.mars),
                    );
                    close_transport(stale.transport).await;
                    self.shared.clear_doomed();
                    self.shared.lock.release(permit).map_err(LockError::from)?;
                    tracing::info!(
                        connection_id = self.shared.id,
                        attempt,
                        server = %self.session.identity,
                        "session recovered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() || e.kind() == ErrorKind::TimeoutExpired => {
                    tracing::warn!(attempt, error = %e, "session recovery attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(Error::SessionNotRecoverable))
    }

    /// Close the connection.
    ///
    /// If the calling thread already holds the lock with the close right,
    /// the transport is torn down under that permit and the caller keeps it.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the disconnect failed.
    pub async fn close(self) -> Result<()> {
        let permit = if self.shared.lock.owns_for_close() {
            tracing::debug!(
                connection_id = self.shared.id,
                "closing under the caller's permit"
            );
            None
        } else {
            let permit = self.shared.lock.acquire_async(true).await;
            permit.set_owns_for_close();
            Some(permit)
        };
        self.shared.closed.store(true, Ordering::Release);
        let mut transport = self.session.transport;
        let result = transport.disconnect().await;
        drop(permit);
        tracing::debug!(connection_id = self.shared.id, "connection closed");
        result
    }

    /// The session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The session, mutably.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Shared connection state.
    #[must_use]
    pub fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    /// Connection configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attempts made by the most recent login.
    #[must_use]
    pub fn login_attempts(&self) -> &[ConnectionAttempt] {
        self.orchestrator.history()
    }

    /// Whether the connection has been marked unusable.
    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.shared.is_doomed()
    }
}

async fn close_transport(mut transport: Box<dyn Transport>) {
    if let Err(e) = transport.disconnect().await {
        tracing::debug!(error = %e, "error while closing stale transport");
    }
}
