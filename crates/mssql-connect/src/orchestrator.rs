//! Login state machine.
//!
//! A login resolves the target, connects, exchanges PRELOGIN and LOGIN7 and
//! folds the server's response records into a [`CapabilitySet`] and a
//! [`SessionState`]. Around that single attempt the orchestrator applies the
//! retry policy:
//!
//! ```text
//! ResolvingIdentity -> Connecting -> HandshakeNegotiation -> LoggingIn
//!     -> AwaitingFeatureAcks -> Open | Routed | FailedTransient | FailedFatal
//! ```
//!
//! `Routed` loops back to `ResolvingIdentity` with the identity the server
//! pointed at. Without a failover partner the single target is retried
//! with exponential backoff; with one, the primary and the partner are
//! tried in turn with growing time slices. All attempts share one
//! [`TimeoutBudget`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mssql_auth::{
    AuthContextKey, Credentials, TokenCache, TokenProvider, TokenRequest, acquire_with_retry,
};
use tds_protocol::{
    CapabilitySet, Done, DoneStatus, EnvChange, EnvChangeType, FeatureExtAck, FeatureId,
    FedAuthInfo, LoginAck, ProtocolError, RequestedFeatures, RoutingInfo, ServerError,
    SessionStateToken, TokenType,
};

use crate::config::{ApplicationIntent, Config};
use crate::connection::ConnectionShared;
use crate::error::{Error, ErrorKind, Result};
use crate::pool::PoolGroupContext;
use crate::server_identity::{DataSource, ServerIdentity};
use crate::session_state::SessionState;
use crate::timeout::TimeoutBudget;
use crate::transport::{Connector, FedAuthLogin, LoginRequest, PreLoginRequest, Transport};

/// Phase of the login state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// Working out where to connect.
    ResolvingIdentity,
    /// Opening the transport.
    Connecting,
    /// Exchanging PRELOGIN.
    HandshakeNegotiation,
    /// Sending LOGIN7.
    LoggingIn,
    /// Reading the login response.
    AwaitingFeatureAcks,
    /// The session is open.
    Open,
    /// The server redirected the login.
    Routed,
    /// The last attempt failed in a retryable way.
    FailedTransient,
    /// The login failed for good.
    FailedFatal,
}

/// Outcome of one physical connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    /// Target of the attempt.
    pub target: ServerIdentity,
    /// Whether the attempt produced an open session.
    pub succeeded: bool,
    /// Where the server redirected the login, if it did.
    pub routed_to: Option<ServerIdentity>,
    /// Why the attempt failed.
    pub error: Option<ErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FedAuthRetry {
    NotStarted,
    HasLoginToken,
    Retrying,
}

/// An open session handed over by a successful login.
pub struct EstablishedSession {
    /// Logged-in transport.
    pub transport: Box<dyn Transport>,
    /// Identity that accepted the login.
    pub identity: ServerIdentity,
    /// Negotiated capabilities.
    pub capabilities: CapabilitySet,
    /// Session state as of the end of the login.
    pub session: SessionState,
    /// Negotiated packet size.
    pub packet_size: u32,
    /// Failover partner advertised by the server.
    pub failover_partner: Option<String>,
    /// User instance the server started, if any.
    pub user_instance: Option<String>,
    /// Whether the login succeeded on the failover partner.
    pub connected_to_failover: bool,
    /// Transaction environment changes seen during login.
    pub transaction_events: Vec<EnvChange>,
}

impl fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("identity", &self.identity)
            .field("packet_size", &self.packet_size)
            .field("failover_partner", &self.failover_partner)
            .field("connected_to_failover", &self.connected_to_failover)
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Open(Box<EstablishedSession>),
    Routed(RoutingInfo),
}

enum Step {
    Open(Box<EstablishedSession>),
    Routed(ServerIdentity),
}

/// What the login response carried besides capabilities and session state.
#[derive(Default)]
struct LoginProgress {
    login_ack: bool,
    first_error: Option<Error>,
    routing: Option<RoutingInfo>,
    packet_size: Option<u32>,
    partner: Option<String>,
    user_instance: Option<String>,
    transaction_events: Vec<EnvChange>,
}

/// Drives logins for one connection.
pub struct ConnectionOrchestrator {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    pool: Option<Arc<PoolGroupContext>>,
    token_cache: Arc<TokenCache>,
    budget: TimeoutBudget,
    state: LoginState,
    routing_count: u8,
    fed_auth_retry: FedAuthRetry,
    server_partner: Option<String>,
    history: Vec<ConnectionAttempt>,
}

impl fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOrchestrator")
            .field("state", &self.state)
            .field("routing_count", &self.routing_count)
            .field("server_partner", &self.server_partner)
            .field("attempts", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionOrchestrator {
    /// Create an orchestrator. Without a pool group the token cache is private.
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        pool: Option<Arc<PoolGroupContext>>,
    ) -> Self {
        let token_cache = pool
            .as_ref()
            .map_or_else(|| Arc::new(TokenCache::new()), |p| Arc::clone(p.token_cache()));
        let budget = TimeoutBudget::new(config.timeouts.login_budget());
        Self {
            config,
            connector,
            pool,
            token_cache,
            budget,
            state: LoginState::ResolvingIdentity,
            routing_count: 0,
            fed_auth_retry: FedAuthRetry::NotStarted,
            server_partner: None,
            history: Vec::new(),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> LoginState {
        self.state
    }

    /// Attempts made by the last login, oldest first.
    #[must_use]
    pub fn history(&self) -> &[ConnectionAttempt] {
        &self.history
    }

    /// Redirects followed by the last login.
    #[must_use]
    pub fn routing_count(&self) -> u8 {
        self.routing_count
    }

    /// Log in, replaying `recovery` if this is a reconnect.
    ///
    /// # Errors
    ///
    /// Fails with the first fatal error, or with [`Error::TimeoutExpired`]
    /// wrapping the last transient error once the budget is spent.
    pub async fn login(
        &mut self,
        shared: &ConnectionShared,
        recovery: Option<&SessionState>,
    ) -> Result<EstablishedSession> {
        self.budget = TimeoutBudget::new(self.config.timeouts.login_budget());
        self.state = LoginState::ResolvingIdentity;
        self.routing_count = 0;
        self.fed_auth_retry = FedAuthRetry::NotStarted;
        self.server_partner = None;
        self.history.clear();

        if self.config.multi_subnet_failover && self.config.failover_partner.is_some() {
            self.state = LoginState::FailedFatal;
            return Err(Error::InvalidPartnerConfiguration(
                "multi-subnet failover cannot be combined with a failover partner",
            ));
        }

        let recovery_data = recovery.map(SessionState::encode_recovery_request);
        let mut base = recovery.map_or_else(SessionState::new, SessionState::for_recovery);

        let result = match self.config.failover_partner.clone() {
            Some(partner) => {
                let failover_first = self.pool.as_ref().is_some_and(|p| p.prefer_failover());
                self.login_with_failover(
                    shared,
                    &mut base,
                    partner,
                    failover_first,
                    recovery_data.as_ref(),
                )
                .await
            }
            None => {
                self.login_no_failover(shared, &mut base, recovery_data.as_ref())
                    .await
            }
        };

        let established = match result {
            Ok(established) => established,
            Err(e) => {
                self.state = LoginState::FailedFatal;
                if e.dooms_connection() {
                    shared.doom();
                }
                tracing::warn!(error = %e, attempts = self.history.len(), "login failed");
                return Err(e);
            }
        };

        if let Err(e) = self.check_partner_rules(&established) {
            let mut transport = established.transport;
            close_quietly(transport.as_mut()).await;
            return Err(e);
        }

        if let Some(pool) = &self.pool {
            pool.record_login(established.connected_to_failover);
        }
        tracing::info!(
            server = %established.identity,
            attempts = self.history.len(),
            redirects = self.routing_count,
            failover = established.connected_to_failover,
            "login complete"
        );
        Ok(established)
    }

    async fn login_no_failover(
        &mut self,
        shared: &ConnectionShared,
        base: &mut SessionState,
        recovery: Option<&Bytes>,
    ) -> Result<EstablishedSession> {
        let multi_subnet = self.config.multi_subnet_failover;
        let slice = self.budget.slice();
        let mut backoff = self.config.retry.backoff();
        let mut failed: u32 = 0;
        let mut routed: Option<ServerIdentity> = None;

        loop {
            self.state = LoginState::ResolvingIdentity;
            let target = match &routed {
                Some(identity) => identity.clone(),
                None => ServerIdentity::resolve(
                    &self.config.server,
                    &self.config,
                    true,
                    base.resolved_aliases_mut(),
                )?,
            };
            let timeout = if multi_subnet {
                Some(self.budget.multi_subnet_attempt_timeout(slice, failed + 1))
            } else {
                self.budget.remaining()
            };

            let error = match self.run_attempt(&target, timeout, base, recovery).await {
                Ok(Step::Open(established)) => return Ok(*established),
                Ok(Step::Routed(next)) => {
                    routed = Some(next);
                    continue;
                }
                Err(e) => e,
            };

            if self.retry_with_cached_token(&error, shared) {
                continue;
            }
            if !error.is_transient() {
                return Err(error);
            }

            if let Some(partner) = self.server_partner.clone() {
                if multi_subnet {
                    return Err(Error::InvalidPartnerConfiguration(
                        "multi-subnet failover cannot be combined with a server-provided partner",
                    ));
                }
                tracing::info!(partner = %partner, "server advertised a failover partner, switching to failover");
                let partner = DataSource::parse(&partner)?;
                return self
                    .login_with_failover(shared, base, partner, true, recovery)
                    .await;
            }

            failed += 1;
            let sleep = backoff.peek();
            if !self.budget.can_sleep(sleep) {
                return Err(Error::timeout_expired(Some(error)));
            }
            tracing::warn!(
                host = %target,
                attempt = failed,
                delay_ms = sleep.as_millis() as u64,
                error = %error,
                "login attempt failed, retrying"
            );
            tokio::time::sleep(sleep).await;
            backoff.next();
        }
    }

    async fn login_with_failover(
        &mut self,
        shared: &ConnectionShared,
        base: &mut SessionState,
        configured_partner: DataSource,
        failover_first: bool,
        recovery: Option<&Bytes>,
    ) -> Result<EstablishedSession> {
        let slice = self.budget.slice();
        let mut backoff = self.config.retry.backoff();
        let mut use_failover = failover_first;
        let mut failed: u32 = 0;
        // Redirects are remembered per host: [primary, partner].
        let mut routes: [Option<ServerIdentity>; 2] = [None, None];

        loop {
            self.state = LoginState::ResolvingIdentity;
            let slot = usize::from(use_failover);
            let target = match &routes[slot] {
                Some(identity) => identity.clone(),
                None => {
                    let source = if use_failover {
                        match &self.server_partner {
                            Some(name) => DataSource::parse(name)?,
                            None => configured_partner.clone(),
                        }
                    } else {
                        self.config.server.clone()
                    };
                    ServerIdentity::resolve(&source, &self.config, true, base.resolved_aliases_mut())?
                }
            };
            let timeout = self.budget.failover_attempt_timeout(slice, failed + 1);

            let error = match self.run_attempt(&target, Some(timeout), base, recovery).await {
                Ok(Step::Open(mut established)) => {
                    if use_failover && established.failover_partner.is_none() {
                        return Err(Error::InvalidPartnerConfiguration(
                            "failover host accepted the login without reporting a partner",
                        ));
                    }
                    established.connected_to_failover = use_failover;
                    return Ok(*established);
                }
                Ok(Step::Routed(next)) => {
                    routes[slot] = Some(next);
                    continue;
                }
                Err(e) => e,
            };

            if self.retry_with_cached_token(&error, shared) {
                continue;
            }
            if !error.is_transient() {
                return Err(error);
            }
            if self.budget.is_expired() {
                return Err(Error::timeout_expired(Some(error)));
            }

            failed += 1;
            tracing::warn!(
                host = %target,
                attempt = failed,
                failover = use_failover,
                error = %error,
                "login attempt failed, trying other host"
            );

            // Sleep only once both hosts of a pair have failed.
            if failed % 2 == 0 {
                let sleep = backoff.peek();
                if !self.budget.can_sleep(sleep) {
                    return Err(Error::timeout_expired(Some(error)));
                }
                tokio::time::sleep(sleep).await;
                backoff.next();
            }
            use_failover = !use_failover;
        }
    }

    /// One attempt, bounded by `timeout`, with its outcome recorded.
    async fn run_attempt(
        &mut self,
        target: &ServerIdentity,
        timeout: Option<Duration>,
        base: &SessionState,
        recovery: Option<&Bytes>,
    ) -> Result<Step> {
        tracing::info!(
            host = %target,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "connecting"
        );

        let result = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.attempt(target, timeout, base, recovery))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::ConnectTimeout {
                        host: target.to_string(),
                    }),
                }
            }
            None => self.attempt(target, None, base, recovery).await,
        };

        let result = match result {
            Ok(Outcome::Open(established)) => Ok(Step::Open(established)),
            Ok(Outcome::Routed(routing)) => self.follow_route(target, &routing).map(Step::Routed),
            Err(e) => Err(e),
        };

        self.state = match &result {
            Ok(Step::Open(_)) => LoginState::Open,
            Ok(Step::Routed(_)) => LoginState::Routed,
            Err(e) if e.is_transient() => LoginState::FailedTransient,
            Err(_) => LoginState::FailedFatal,
        };
        self.history.push(ConnectionAttempt {
            target: target.clone(),
            succeeded: matches!(result, Ok(Step::Open(_))),
            routed_to: match &result {
                Ok(Step::Routed(identity)) => Some(identity.clone()),
                _ => None,
            },
            error: result.as_ref().err().map(Error::kind),
        });
        result
    }

    fn follow_route(&mut self, from: &ServerIdentity, routing: &RoutingInfo) -> Result<ServerIdentity> {
        let redirect = &self.config.redirect;
        if !redirect.follow_redirects || self.routing_count >= redirect.max_redirects {
            return Err(Error::RoutingLimitExceeded {
                max: redirect.max_redirects,
            });
        }
        if self.budget.is_expired() {
            return Err(Error::timeout_expired(None));
        }
        self.routing_count += 1;

        let next = ServerIdentity::from_routing(
            &self.config,
            routing,
            from.resolved_name(),
            from.service_principal_name(),
        );
        tracing::info!(
            from = %from,
            to = %next,
            redirect = self.routing_count,
            "following routing redirect"
        );
        Ok(next)
    }

    fn retry_with_cached_token(&mut self, error: &Error, shared: &ConnectionShared) -> bool {
        if self.fed_auth_retry != FedAuthRetry::HasLoginToken || !error.is_timeout() {
            return false;
        }
        tracing::warn!(error = %error, "login timed out after token acquisition, retrying with cached token");
        self.budget.reset();
        shared.clear_doomed();
        self.fed_auth_retry = FedAuthRetry::Retrying;
        true
    }

    fn check_partner_rules(&mut self, established: &EstablishedSession) -> Result<()> {
        if established.failover_partner.is_none() {
            return Ok(());
        }
        if self.config.multi_subnet_failover {
            self.state = LoginState::FailedFatal;
            return Err(Error::InvalidPartnerConfiguration(
                "multi-subnet failover cannot be combined with a server-provided partner",
            ));
        }
        if self.config.application_intent == ApplicationIntent::ReadOnly
            && !established.capabilities.read_only_failover_supported()
        {
            self.state = LoginState::FailedFatal;
            return Err(Error::InvalidPartnerConfiguration(
                "read-only intent requires a server that supports read-only failover",
            ));
        }
        Ok(())
    }

    /// One physical connect, handshake and login.
    async fn attempt(
        &mut self,
        target: &ServerIdentity,
        timeout: Option<Duration>,
        base: &SessionState,
        recovery: Option<&Bytes>,
    ) -> Result<Outcome> {
        let provider = match &self.config.credentials {
            Credentials::Federated { method, .. } => Some(self.config.providers.resolve(*method)?),
            _ => None,
        };

        self.state = LoginState::Connecting;
        let mut transport = self.connector.connect(target, timeout).await?;

        self.state = LoginState::HandshakeNegotiation;
        let ack = transport
            .send_handshake(&PreLoginRequest {
                encrypt: self.config.encrypt,
                mars: self.config.mars,
                fed_auth_required: self.config.credentials.is_federated(),
                instance: target.instance().map(str::to_string),
            })
            .await?;

        let features = self.config.login_features();
        let mut capabilities = CapabilitySet::new(features);
        let mut session = base.clone();
        session.set_encrypted(ack.encryption);

        self.state = LoginState::LoggingIn;
        let login = self.build_login(target, features, recovery);
        transport.send_login(&login).await?;

        self.state = LoginState::AwaitingFeatureAcks;
        let mut progress = LoginProgress::default();
        loop {
            let Some(record) = transport.read_next_record().await? else {
                return Err(Error::ConnectionClosed);
            };
            let done = self
                .process_record(
                    record.token_type,
                    record.data,
                    transport.as_mut(),
                    provider.as_ref(),
                    &mut capabilities,
                    &mut session,
                    &mut progress,
                )
                .await?;
            if done {
                break;
            }
        }

        if let Some(error) = progress.first_error.take() {
            close_quietly(transport.as_mut()).await;
            return Err(error);
        }
        if let Some(routing) = progress.routing.take() {
            close_quietly(transport.as_mut()).await;
            return Ok(Outcome::Routed(routing));
        }
        if !progress.login_ack {
            return Err(Error::LoginIncomplete("server finished without LOGINACK"));
        }
        if recovery.is_some() && !capabilities.session_recovery_acknowledged() {
            return Err(Error::LoginIncomplete(
                "server did not acknowledge session recovery",
            ));
        }

        Ok(Outcome::Open(Box::new(EstablishedSession {
            transport,
            identity: target.clone(),
            capabilities,
            session,
            packet_size: progress.packet_size.unwrap_or(self.config.packet_size),
            failover_partner: progress.partner,
            user_instance: progress.user_instance,
            connected_to_failover: false,
            transaction_events: progress.transaction_events,
        })))
    }

    fn build_login(
        &self,
        target: &ServerIdentity,
        features: RequestedFeatures,
        recovery: Option<&Bytes>,
    ) -> LoginRequest {
        let (user, password, fed_auth) = match &self.config.credentials {
            Credentials::SqlServer { username, password } => {
                (username.to_string(), password.to_string(), None)
            }
            Credentials::AccessToken { token } => (
                String::new(),
                String::new(),
                Some(FedAuthLogin::SecurityToken(token.to_string())),
            ),
            Credentials::Federated { .. } => {
                (String::new(), String::new(), Some(FedAuthLogin::Library))
            }
        };

        LoginRequest {
            tds_version: self.config.tds_version,
            packet_size: self.config.packet_size,
            workstation: self.config.workstation_id.clone().unwrap_or_default(),
            user,
            password,
            app_name: self.config.application_name.clone(),
            server_name: target.user_supplied_name().to_string(),
            language: self.config.language.clone().unwrap_or_default(),
            database: target.resolved_database().unwrap_or_default().to_string(),
            features,
            fed_auth,
            session_recovery: recovery.cloned(),
            read_only_intent: self.config.application_intent == ApplicationIntent::ReadOnly,
        }
    }

    /// Apply one login response record. Returns `true` at the final DONE.
    #[allow(clippy::too_many_arguments)]
    async fn process_record(
        &mut self,
        token_type: u8,
        mut data: Bytes,
        transport: &mut dyn Transport,
        provider: Option<&Arc<dyn TokenProvider>>,
        capabilities: &mut CapabilitySet,
        session: &mut SessionState,
        progress: &mut LoginProgress,
    ) -> Result<bool> {
        let Some(token) = TokenType::from_u8(token_type) else {
            tracing::debug!(token_type, "skipping unexpected token during login");
            return Ok(false);
        };

        match token {
            TokenType::LoginAck => {
                let ack = LoginAck::decode(&mut data)?;
                capabilities.process_login_ack(&ack)?;
                session.set_protocol_version(ack.tds_version);
                progress.login_ack = true;
            }
            TokenType::FeatureExtAck => {
                for feature in FeatureExtAck::decode(&mut data)?.features {
                    capabilities.process_feature_ack(feature.feature_id, &feature.data)?;
                    if feature.feature_id == FeatureId::SessionRecovery as u8 {
                        session.record(&feature.data)?;
                    }
                }
            }
            TokenType::EnvChange => {
                if let Some(change) = EnvChange::decode(&mut data)? {
                    self.apply_env_change(change, session, progress)?;
                }
            }
            TokenType::Error => {
                let error = ServerError::decode(&mut data)?;
                tracing::warn!(
                    number = error.number,
                    class = error.class,
                    state = error.state,
                    message = %error.message,
                    "server error during login"
                );
                if error.class > 10 && progress.first_error.is_none() {
                    progress.first_error = Some(Error::from_server(&error));
                }
            }
            TokenType::Info => {
                let info = ServerError::decode(&mut data)?;
                tracing::debug!(number = info.number, message = %info.message, "server info");
            }
            TokenType::SessionState => {
                let state = SessionStateToken::decode(&mut data)?;
                session.apply_state_token(state.sequence, state.recoverable, &state.records);
            }
            TokenType::FedAuthInfo => {
                let info = FedAuthInfo::decode(&mut data)?;
                let Some(provider) = provider else {
                    return Err(ProtocolError::UnrequestedFeature(FeatureId::FedAuth as u8).into());
                };
                let token = self.obtain_token(Arc::clone(provider), &info).await?;
                if self.fed_auth_retry == FedAuthRetry::NotStarted {
                    self.fed_auth_retry = FedAuthRetry::HasLoginToken;
                }
                transport.send_fed_auth_token(&token).await?;
            }
            TokenType::Done => {
                let done = Done::decode(&mut data)?;
                if !done.status.contains(DoneStatus::MORE) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn obtain_token(
        &self,
        provider: Arc<dyn TokenProvider>,
        info: &FedAuthInfo,
    ) -> Result<Vec<u8>> {
        tracing::debug!(sts_url = %info.sts_url, spn = %info.spn, "server requested a federated token");
        let key = AuthContextKey::new(&info.sts_url, &info.spn);
        let request =
            TokenRequest::new(&info.sts_url, &info.spn).with_credentials(&self.config.credentials);
        let deadline = self.budget.deadline();
        let policy = self.config.token_acquisition;

        let token = self
            .token_cache
            .get_or_refresh(&key, || async move {
                acquire_with_retry(provider.as_ref(), &request, deadline, &policy).await
            })
            .await?;
        Ok(token.to_utf16le())
    }

    fn apply_env_change(
        &mut self,
        change: EnvChange,
        session: &mut SessionState,
        progress: &mut LoginProgress,
    ) -> Result<()> {
        let new_value = change.new_value.as_str().unwrap_or_default();
        match change.env_type {
            EnvChangeType::Database => {
                tracing::debug!(database = %new_value, "database changed");
                session.set_database(new_value);
            }
            EnvChangeType::Language => {
                tracing::debug!(language = %new_value, "language changed");
                session.set_language(new_value);
            }
            EnvChangeType::PacketSize => {
                let size = new_value
                    .parse()
                    .map_err(|_| ProtocolError::MalformedEnvChange {
                        env_type: EnvChangeType::PacketSize as u8,
                        reason: format!("invalid packet size: {new_value}"),
                    })?;
                tracing::debug!(packet_size = size, "packet size changed");
                progress.packet_size = Some(size);
            }
            EnvChangeType::SqlCollation => {
                if let Some(collation) = change.collation()? {
                    session.set_collation(collation);
                }
            }
            EnvChangeType::RealTimeLogShipping => {
                if !new_value.is_empty() {
                    tracing::debug!(partner = %new_value, "server advertised failover partner");
                    self.server_partner = Some(new_value.to_string());
                    progress.partner = Some(new_value.to_string());
                }
            }
            EnvChangeType::ResetConnectionCompletionAck => session.reset(),
            EnvChangeType::UserInstanceStarted => {
                progress.user_instance = Some(new_value.to_string());
            }
            EnvChangeType::Routing => {
                if let Some(routing) = change.routing() {
                    routing.validate()?;
                    tracing::debug!(server = %routing.server, port = routing.port, "routing requested");
                    progress.routing = Some(routing.clone());
                }
            }
            t if t.is_transaction_event() => progress.transaction_events.push(change),
            other => tracing::debug!(env_type = ?other, "ignoring environment change"),
        }
        Ok(())
    }
}

async fn close_quietly(transport: &mut dyn Transport) {
    if let Err(e) = transport.disconnect().await {
        tracing::debug!(error = %e, "error while closing transport");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector whose every connect fails with a reset.
    #[derive(Default)]
    struct RefusingConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(
            &self,
            _target: &ServerIdentity,
            _timeout: Option<Duration>,
        ) -> Result<Box<dyn Transport>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into())
        }
    }

    fn orchestrator(config: Config, connector: Arc<RefusingConnector>) -> ConnectionOrchestrator {
        ConnectionOrchestrator::new(Arc::new(config), connector, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_subnet_with_partner_is_rejected_before_connecting() {
        let connector = Arc::new(RefusingConnector::default());
        let config = Config::new()
            .multi_subnet_failover(true)
            .failover_partner(DataSource::new("mirror"));
        let mut orchestrator = orchestrator(config, Arc::clone(&connector));

        let err = orchestrator
            .login(&ConnectionShared::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPartnerConfiguration);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.state(), LoginState::FailedFatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connects_exhaust_budget() {
        let connector = Arc::new(RefusingConnector::default());
        let config = Config::new().connect_timeout(Duration::from_secs(2));
        let mut orchestrator = orchestrator(config, Arc::clone(&connector));

        let started = tokio::time::Instant::now();
        let err = orchestrator
            .login(&ConnectionShared::new(), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TimeoutExpired);
        // Sleeps of 100, 200, 400 and 800 ms fit in 2 s; the next 1000 ms does not.
        assert_eq!(connector.calls.load(Ordering::SeqCst), 5);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert!(orchestrator.history().iter().all(|a| !a.succeeded));
        assert_eq!(
            orchestrator.history()[0].error,
            Some(ErrorKind::Transport)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_alternates_hosts() {
        let connector = Arc::new(RefusingConnector::default());
        let config = Config::new()
            .host("primary")
            .failover_partner(DataSource::new("mirror"))
            .connect_timeout(Duration::from_secs(1));
        let mut orchestrator = orchestrator(config, Arc::clone(&connector));

        let err = orchestrator
            .login(&ConnectionShared::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutExpired);

        let hosts: Vec<_> = orchestrator
            .history()
            .iter()
            .map(|a| a.target.resolved_name().to_string())
            .collect();
        assert!(hosts.len() >= 4);
        for (i, host) in hosts.iter().enumerate() {
            let expected = if i % 2 == 0 { "primary" } else { "mirror" };
            assert_eq!(host, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_hint_tries_failover_first() {
        let connector = Arc::new(RefusingConnector::default());
        let pool = PoolGroupContext::new();
        pool.record_login(true);
        let config = Config::new()
            .host("primary")
            .failover_partner(DataSource::new("mirror"))
            .connect_timeout(Duration::from_millis(500));
        let mut orchestrator =
            ConnectionOrchestrator::new(Arc::new(config), connector, Some(pool));

        orchestrator
            .login(&ConnectionShared::new(), None)
            .await
            .unwrap_err();
        assert_eq!(
            orchestrator.history()[0].target.resolved_name(),
            "mirror"
        );
    }

    #[test]
    fn test_build_login_uses_identity_database() {
        let config = Config::new()
            .database("app")
            .language("us_english")
            .application_intent(ApplicationIntent::ReadOnly)
            .credentials(Credentials::sql_server("sa", "pw"));
        let orchestrator = orchestrator(config, Arc::new(RefusingConnector::default()));
        let routed = ServerIdentity::from_routing(
            &orchestrator.config,
            &RoutingInfo {
                protocol: 0,
                port: 11000,
                server: "replica".into(),
                database: Some("routed_db".into()),
            },
            "gateway",
            None,
        );

        let login = orchestrator.build_login(&routed, RequestedFeatures::standard(), None);
        assert_eq!(login.database, "routed_db");
        assert_eq!(login.server_name, "replica,11000");
        assert_eq!(login.language, "us_english");
        assert_eq!(login.user, "sa");
        assert!(login.read_only_intent);
        assert!(login.fed_auth.is_none());
        assert!(!format!("{login:?}").contains("pw"));
    }
}
