//! Connection configuration.

use std::collections::HashMap;
use std::time::Duration;

use mssql_auth::{AcquirePolicy, AuthenticationMethod, Credentials, ProviderRegistry};
use tds_protocol::{RequestedFeatures, TdsVersion};

use crate::error::{Error, Result};
use crate::server_identity::DataSource;
use crate::timeout::Backoff;

/// Smallest packet size the server accepts.
pub const MIN_PACKET_SIZE: u32 = 512;
/// Largest packet size the server accepts.
pub const MAX_PACKET_SIZE: u32 = 32768;

/// Configuration for server-issued routing redirects.
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    /// Maximum number of redirects followed within one login (default: 10).
    pub max_redirects: u8,
    /// Whether to follow redirects automatically (default: true).
    pub follow_redirects: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            follow_redirects: true,
        }
    }
}

impl RedirectConfig {
    /// Create a new redirect configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of redirects.
    #[must_use]
    pub fn max_redirects(mut self, max: u8) -> Self {
        self.max_redirects = max;
        self
    }

    /// Enable or disable automatic redirect following.
    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Disable automatic redirect following.
    ///
    /// A routing response then fails the login with
    /// [`Error::RoutingLimitExceeded`].
    #[must_use]
    pub fn no_follow() -> Self {
        Self {
            max_redirects: 0,
            follow_redirects: false,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Budget for the whole login, across retries, failover and redirects
    /// (default: 15s). Zero means no limit.
    pub connect_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the login budget.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The login budget, or `None` when unlimited.
    #[must_use]
    pub fn login_budget(&self) -> Option<Duration> {
        (!self.connect_timeout.is_zero()).then_some(self.connect_timeout)
    }
}

/// Retry policy for login attempts and session recovery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep after the first failed attempt (default: 100ms).
    pub initial_backoff: Duration,
    /// Ceiling for the sleep between attempts (default: 1s).
    pub max_backoff: Duration,
    /// Reconnect attempts made to recover a broken session (default: 1).
    /// Zero disables session recovery.
    pub connect_retry_count: u8,
    /// Pause between session recovery attempts (default: 10s).
    pub connect_retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            connect_retry_count: 1,
            connect_retry_interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial backoff duration.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff duration.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the number of session recovery attempts.
    #[must_use]
    pub fn connect_retry_count(mut self, count: u8) -> Self {
        self.connect_retry_count = count;
        self
    }

    /// Set the pause between session recovery attempts.
    #[must_use]
    pub fn connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    /// Disable session recovery.
    #[must_use]
    pub fn no_recovery() -> Self {
        Self {
            connect_retry_count: 0,
            ..Self::default()
        }
    }

    /// Start a fresh backoff schedule.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff)
    }
}

/// Workload type declared to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplicationIntent {
    /// Read/write workload.
    #[default]
    ReadWrite,
    /// Read-only workload, eligible for readable secondaries.
    ReadOnly,
}

impl ApplicationIntent {
    fn parse(value: &str) -> Result<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "readwrite" => Ok(Self::ReadWrite),
            "readonly" => Ok(Self::ReadOnly),
            _ => Err(Error::Config(format!("invalid application intent: {value}"))),
        }
    }
}

/// Configuration for connecting to SQL Server.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future releases without breaking semver. Use [`Config::default()`]
/// or [`Config::from_connection_string()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Primary server.
    pub server: DataSource,

    /// Failover partner configured by the user.
    pub failover_partner: Option<DataSource>,

    /// Database name.
    pub database: Option<String>,

    /// Authentication credentials.
    pub credentials: Credentials,

    /// Token providers for federated authentication methods.
    pub providers: ProviderRegistry,

    /// Retry bounds for token acquisition.
    pub token_acquisition: AcquirePolicy,

    /// Application name (shown in SQL Server management tools).
    pub application_name: String,

    /// Client workstation name sent with the login.
    pub workstation_id: Option<String>,

    /// Session language.
    pub language: Option<String>,

    /// Requested TDS packet size.
    pub packet_size: u32,

    /// Connect to all addresses of a multi-subnet listener in parallel-friendly slices.
    pub multi_subnet_failover: bool,

    /// Declared workload type.
    pub application_intent: ApplicationIntent,

    /// Whether to require encryption (TLS).
    pub encrypt: bool,

    /// Whether to enable MARS (Multiple Active Result Sets).
    pub mars: bool,

    /// Service principal name override.
    pub server_spn: Option<String>,

    /// Local alias table, keyed by lowercase alias, in `"protocol:host,port"` form.
    pub aliases: HashMap<String, String>,

    /// Feature extensions requested in LOGIN7.
    pub requested_features: RequestedFeatures,

    /// Requested TDS protocol version.
    pub tds_version: TdsVersion,

    /// Redirect handling configuration.
    pub redirect: RedirectConfig,

    /// Retry policy.
    pub retry: RetryPolicy,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DataSource::new("localhost"),
            failover_partner: None,
            database: None,
            credentials: Credentials::sql_server("", ""),
            providers: ProviderRegistry::new(),
            token_acquisition: AcquirePolicy::default(),
            application_name: "mssql-connect".to_string(),
            workstation_id: None,
            language: None,
            packet_size: 8000,
            multi_subnet_failover: false,
            application_intent: ApplicationIntent::ReadWrite,
            encrypt: true,
            mars: false,
            server_spn: None,
            aliases: HashMap::new(),
            requested_features: RequestedFeatures::standard(),
            tds_version: TdsVersion::V7_4,
            redirect: RedirectConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0"
    {
        Ok(false)
    } else {
        Err(Error::Config(format!("invalid boolean for {key}: {value}")))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection string into configuration.
    ///
    /// Supports ADO.NET-style connection strings:
    /// ```text
    /// Server=tcp:db.example.net,1433;Database=app;Failover Partner=db2;Connect Timeout=30;
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut user_id: Option<String> = None;
        let mut password: Option<String> = None;
        let mut method: Option<AuthenticationMethod> = None;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "address" | "addr" | "network address" => {
                    config.server = DataSource::parse(value)?;
                }
                "failover partner" => {
                    config.failover_partner = if value.is_empty() {
                        None
                    } else {
                        Some(DataSource::parse(value)?)
                    };
                }
                "database" | "initial catalog" => {
                    config.database = Some(value.to_string());
                }
                "user id" | "uid" | "user" => {
                    user_id = Some(value.to_string());
                }
                "password" | "pwd" => {
                    password = Some(value.to_string());
                }
                "authentication" => {
                    method = Some(value.parse().map_err(Error::Authentication)?);
                }
                "connect timeout" | "connection timeout" | "timeout" => {
                    let secs: u64 = parse_number(&key, value)?;
                    config.timeouts.connect_timeout = Duration::from_secs(secs);
                }
                "multisubnetfailover" | "multi subnet failover" => {
                    config.multi_subnet_failover = parse_bool(&key, value)?;
                }
                "applicationintent" | "application intent" => {
                    config.application_intent = ApplicationIntent::parse(value)?;
                }
                "current language" | "language" => {
                    config.language = Some(value.to_string());
                }
                "packet size" => {
                    let size: u32 = parse_number(&key, value)?;
                    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
                        return Err(Error::Config(format!(
                            "packet size must be between {MIN_PACKET_SIZE} and {MAX_PACKET_SIZE}: {size}"
                        )));
                    }
                    config.packet_size = size;
                }
                "connectretrycount" | "connect retry count" => {
                    config.retry.connect_retry_count = parse_number(&key, value)?;
                }
                "connectretryinterval" | "connect retry interval" => {
                    let secs: u64 = parse_number(&key, value)?;
                    config.retry.connect_retry_interval = Duration::from_secs(secs);
                }
                "encrypt" => {
                    config.encrypt = value.eq_ignore_ascii_case("strict")
                        || value.eq_ignore_ascii_case("mandatory")
                        || (!value.eq_ignore_ascii_case("optional") && parse_bool(&key, value)?);
                }
                "multipleactiveresultsets" | "mars" => {
                    config.mars = parse_bool(&key, value)?;
                }
                "application name" | "app" => {
                    config.application_name = value.to_string();
                }
                "workstation id" | "wsid" => {
                    config.workstation_id = Some(value.to_string());
                }
                "server spn" | "serverspn" => {
                    config.server_spn = Some(value.to_string());
                }
                "tdsversion" | "tds version" | "protocolversion" | "protocol version" => {
                    config.tds_version = TdsVersion::parse(value).ok_or_else(|| {
                        Error::Config(format!(
                            "invalid TDS version: {value}. Supported values: 7.3, 7.3A, 7.3B, 7.4, 8.0"
                        ))
                    })?;
                }
                _ => {
                    // Ignore unknown options for forward compatibility
                    tracing::debug!(
                        key = key,
                        "ignoring unknown connection string option"
                    );
                }
            }
        }

        config.credentials = match method.unwrap_or(AuthenticationMethod::SqlPassword) {
            AuthenticationMethod::SqlPassword => Credentials::sql_server(
                user_id.unwrap_or_default(),
                password.unwrap_or_default(),
            ),
            AuthenticationMethod::AccessToken => {
                return Err(Error::Config(
                    "access tokens cannot be supplied in a connection string".into(),
                ));
            }
            method => Credentials::Federated {
                method,
                user_id: user_id.map(Into::into),
                secret: password.map(Into::into),
            },
        };

        Ok(config)
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.server.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.server.port = Some(port);
        self
    }

    /// Set the named instance.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.server.instance = Some(instance.into());
        self
    }

    /// Set the primary server from a data source.
    #[must_use]
    pub fn server(mut self, server: DataSource) -> Self {
        self.server = server;
        self
    }

    /// Set the failover partner.
    #[must_use]
    pub fn failover_partner(mut self, partner: DataSource) -> Self {
        self.failover_partner = Some(partner);
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the token provider registry.
    #[must_use]
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the session language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn packet_size(mut self, size: u32) -> Self {
        self.packet_size = size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        self
    }

    /// Enable or disable multi-subnet failover.
    #[must_use]
    pub fn multi_subnet_failover(mut self, enabled: bool) -> Self {
        self.multi_subnet_failover = enabled;
        self
    }

    /// Set the application intent.
    #[must_use]
    pub fn application_intent(mut self, intent: ApplicationIntent) -> Self {
        self.application_intent = intent;
        self
    }

    /// Enable or disable MARS.
    #[must_use]
    pub fn mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Add an alias table entry.
    #[must_use]
    pub fn alias(mut self, name: impl AsRef<str>, target: impl Into<String>) -> Self {
        self.aliases
            .insert(name.as_ref().to_ascii_lowercase(), target.into());
        self
    }

    /// Set the feature extensions requested in LOGIN7.
    #[must_use]
    pub fn requested_features(mut self, features: RequestedFeatures) -> Self {
        self.requested_features = features;
        self
    }

    /// Set the redirect handling configuration.
    #[must_use]
    pub fn redirect(mut self, redirect: RedirectConfig) -> Self {
        self.redirect = redirect;
        self
    }

    /// Set the maximum number of redirects.
    #[must_use]
    pub fn max_redirects(mut self, max: u8) -> Self {
        self.redirect.max_redirects = max;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the login budget.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect_timeout = timeout;
        self
    }

    /// Features to request for this configuration's credentials.
    ///
    /// Federated credentials add FEDAUTH; a zero reconnect count drops
    /// session recovery.
    #[must_use]
    pub fn login_features(&self) -> RequestedFeatures {
        let mut features = self.requested_features;
        features.set(RequestedFeatures::FED_AUTH, self.credentials.is_federated());
        if self.retry.connect_retry_count == 0 {
            features.remove(RequestedFeatures::SESSION_RECOVERY);
        }
        features
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::server_identity::TransportQualifier;

    #[test]
    fn test_connection_string_parsing() {
        let config = Config::from_connection_string(
            "Server=localhost;Database=test;User Id=sa;Password=secret;",
        )
        .unwrap();

        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.database, Some("test".to_string()));
        assert!(config.credentials.is_sql_auth());
        assert_eq!(config.credentials.user_id(), Some("sa"));
    }

    #[test]
    fn test_connection_string_with_qualifier_and_port() {
        let config =
            Config::from_connection_string("Data Source=tcp:db.example.net,1434;").unwrap();

        assert_eq!(config.server.protocol, Some(TransportQualifier::Tcp));
        assert_eq!(config.server.host, "db.example.net");
        assert_eq!(config.server.port, Some(1434));
    }

    #[test]
    fn test_connection_string_with_instance() {
        let config =
            Config::from_connection_string("Server=localhost\\SQLEXPRESS;Database=test;").unwrap();

        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.instance, Some("SQLEXPRESS".to_string()));
    }

    #[test]
    fn test_connection_string_failover_keys() {
        let config = Config::from_connection_string(
            "Server=primary;Failover Partner=mirror,1450;MultiSubnetFailover=false;\
             ApplicationIntent=ReadOnly;Connect Timeout=30;ConnectRetryCount=3;\
             ConnectRetryInterval=5;Current Language=us_english;Packet Size=4096;",
        )
        .unwrap();

        let partner = config.failover_partner.unwrap();
        assert_eq!(partner.host, "mirror");
        assert_eq!(partner.port, Some(1450));
        assert!(!config.multi_subnet_failover);
        assert_eq!(config.application_intent, ApplicationIntent::ReadOnly);
        assert_eq!(config.timeouts.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.connect_retry_count, 3);
        assert_eq!(config.retry.connect_retry_interval, Duration::from_secs(5));
        assert_eq!(config.language.as_deref(), Some("us_english"));
        assert_eq!(config.packet_size, 4096);
    }

    #[test]
    fn test_connection_string_federated_auth() {
        let config = Config::from_connection_string(
            "Server=x.database.windows.net;Authentication=Active Directory Service Principal;\
             User Id=app-id;Password=app-secret;",
        )
        .unwrap();

        assert_eq!(
            config.credentials.method(),
            AuthenticationMethod::ActiveDirectoryServicePrincipal
        );
        assert_eq!(config.credentials.user_id(), Some("app-id"));
        assert!(config.login_features().contains(RequestedFeatures::FED_AUTH));
    }

    #[test]
    fn test_connection_string_rejects_bad_values() {
        assert!(Config::from_connection_string("Server=x;Packet Size=100;").is_err());
        assert!(Config::from_connection_string("Server=x;MultiSubnetFailover=maybe;").is_err());
        assert!(Config::from_connection_string("Server=x;ApplicationIntent=Sideways;").is_err());
        assert!(Config::from_connection_string("Server=x;Authentication=Carrier Pigeon;").is_err());
        assert!(Config::from_connection_string("Server=x;Connect Timeout=abc;").is_err());
        assert!(Config::from_connection_string("Server").is_err());
    }

    #[test]
    fn test_connection_string_ignores_unknown_keys() {
        let config =
            Config::from_connection_string("Server=x;Pooling=true;Min Pool Size=2;").unwrap();
        assert_eq!(config.server.host, "x");
    }

    #[test]
    fn test_command_timeout_key_does_not_touch_login_budget() {
        let config =
            Config::from_connection_string("Server=x;Command Timeout=90;Connect Timeout=5;")
                .unwrap();
        assert_eq!(config.timeouts.login_budget(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_redirect_config_defaults() {
        let config = RedirectConfig::default();
        assert_eq!(config.max_redirects, 10);
        assert!(config.follow_redirects);
    }

    #[test]
    fn test_redirect_config_no_follow() {
        let config = RedirectConfig::no_follow();
        assert_eq!(config.max_redirects, 0);
        assert!(!config.follow_redirects);
    }

    #[test]
    fn test_timeout_zero_is_unlimited() {
        assert_eq!(
            TimeoutConfig::default().login_budget(),
            Some(Duration::from_secs(15))
        );
        let unlimited = TimeoutConfig::new().connect_timeout(Duration::ZERO);
        assert_eq!(unlimited.login_budget(), None);
    }

    #[test]
    fn test_login_features() {
        let config = Config::new();
        let features = config.login_features();
        assert!(features.contains(RequestedFeatures::SESSION_RECOVERY));
        assert!(!features.contains(RequestedFeatures::FED_AUTH));

        let config = Config::new().retry(RetryPolicy::no_recovery());
        assert!(
            !config
                .login_features()
                .contains(RequestedFeatures::SESSION_RECOVERY)
        );
    }

    #[test]
    fn test_packet_size_builder_clamps() {
        assert_eq!(Config::new().packet_size(100).packet_size, MIN_PACKET_SIZE);
        assert_eq!(Config::new().packet_size(65535).packet_size, MAX_PACKET_SIZE);
    }
}
