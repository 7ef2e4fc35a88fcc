//! Addressing of connection targets.
//!
//! A [`DataSource`] is what the user wrote (`tcp:host,1433`, `host\INSTANCE`);
//! a [`ServerIdentity`] is what one login attempt actually connects to after
//! alias resolution or a server-issued redirect.

use std::collections::HashMap;
use std::fmt;

use tds_protocol::RoutingInfo;

use crate::config::Config;
use crate::error::{Error, Result};

/// Transport prefix of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportQualifier {
    /// `tcp:`
    Tcp,
    /// `np:` (named pipes)
    NamedPipe,
    /// `lpc:` (shared memory)
    SharedMemory,
    /// `admin:` (dedicated admin connection)
    Admin,
}

impl TransportQualifier {
    /// Prefix spelling without the colon.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::NamedPipe => "np",
            Self::SharedMemory => "lpc",
            Self::Admin => "admin",
        }
    }

    fn parse(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "np" => Some(Self::NamedPipe),
            "lpc" => Some(Self::SharedMemory),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for TransportQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server name as written in a connection string.
///
/// Accepted forms: `host`, `host,port`, `host\instance`, each optionally
/// prefixed with a transport qualifier such as `tcp:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    /// Transport prefix, if one was given.
    pub protocol: Option<TransportQualifier>,
    /// Host name or address.
    pub host: String,
    /// Explicit port.
    pub port: Option<u16>,
    /// Named instance.
    pub instance: Option<String>,
}

impl DataSource {
    /// A plain host name.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            protocol: None,
            host: host.into(),
            port: None,
            instance: None,
        }
    }

    /// Parse a data source string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty host or an unparseable port.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();

        let (protocol, rest) = match value.split_once(':') {
            Some((prefix, rest)) => match TransportQualifier::parse(prefix.trim()) {
                Some(protocol) => (Some(protocol), rest.trim()),
                None => (None, value),
            },
            None => (None, value),
        };

        let (rest, port) = match rest.rsplit_once(',') {
            Some((head, port)) => {
                let port = port
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid port: {port}")))?;
                (head.trim(), Some(port))
            }
            None => (rest, None),
        };

        let (host, instance) = match rest.split_once('\\') {
            Some((host, instance)) if !instance.is_empty() => {
                (host.trim(), Some(instance.trim().to_string()))
            }
            Some((host, _)) => (host.trim(), None),
            None => (rest, None),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("missing host in data source: {value}")));
        }

        // "." and "(local)" name the local machine.
        let host = if host == "." || host.eq_ignore_ascii_case("(local)") {
            "localhost".to_string()
        } else {
            host.to_string()
        };

        Ok(Self {
            protocol,
            host,
            port,
            instance,
        })
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(protocol) = self.protocol {
            write!(f, "{protocol}:")?;
        }
        f.write_str(&self.host)?;
        if let Some(instance) = &self.instance {
            write!(f, "\\{instance}")?;
        }
        if let Some(port) = self.port {
            write!(f, ",{port}")?;
        }
        Ok(())
    }
}

/// Alias resolutions cached for one logical session, keyed by lowercase host.
pub type AliasCache = HashMap<String, DataSource>;

/// Resolved addressing for one connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    user_supplied_name: String,
    resolved_name: String,
    transport_qualifier: Option<TransportQualifier>,
    port: Option<u16>,
    instance: Option<String>,
    service_principal_name: Option<String>,
    resolved_database: Option<String>,
    pre_routing_name: Option<String>,
}

impl ServerIdentity {
    /// Resolve a data source, consulting the alias table when `alias_lookup`
    /// is set.
    ///
    /// Aliases are looked up in `aliases` first and then in the configured
    /// alias table; table hits are parsed once and cached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a matching alias entry cannot be parsed.
    pub fn resolve(
        source: &DataSource,
        options: &Config,
        alias_lookup: bool,
        aliases: &mut AliasCache,
    ) -> Result<Self> {
        let mut target = source.clone();

        if alias_lookup {
            let key = source.host.to_ascii_lowercase();
            let hit = match aliases.get(&key) {
                Some(cached) => Some(cached.clone()),
                None => match options.aliases.get(&key) {
                    Some(entry) => {
                        let parsed = DataSource::parse(entry)?;
                        tracing::debug!(alias = %source.host, target = %parsed, "resolved server alias");
                        aliases.insert(key, parsed.clone());
                        Some(parsed)
                    }
                    None => None,
                },
            };

            if let Some(alias) = hit {
                target = DataSource {
                    protocol: alias.protocol.or(source.protocol),
                    host: alias.host,
                    port: alias.port.or(source.port),
                    instance: alias.instance.or_else(|| source.instance.clone()),
                };
            }
        }

        let service_principal_name = options
            .server_spn
            .clone()
            .or_else(|| Some(Self::default_spn(&target)));

        Ok(Self {
            user_supplied_name: source.to_string(),
            resolved_name: target.host,
            transport_qualifier: target.protocol,
            port: target.port,
            instance: target.instance,
            service_principal_name,
            resolved_database: options.database.clone(),
            pre_routing_name: None,
        })
    }

    /// Build the identity a routing response points at.
    ///
    /// The new identity always uses TCP, keeps the prior SPN, and opens the
    /// database named by the routing payload (or the configured one).
    pub fn from_routing(
        options: &Config,
        routing: &RoutingInfo,
        prior_resolved_name: &str,
        prior_spn: Option<&str>,
    ) -> Self {
        Self {
            user_supplied_name: format!("{},{}", routing.server, routing.port),
            resolved_name: routing.server.clone(),
            transport_qualifier: Some(TransportQualifier::Tcp),
            port: Some(routing.port),
            instance: None,
            service_principal_name: prior_spn.map(str::to_string),
            resolved_database: routing
                .database
                .clone()
                .or_else(|| options.database.clone()),
            pre_routing_name: Some(prior_resolved_name.to_string()),
        }
    }

    fn default_spn(target: &DataSource) -> String {
        match (&target.instance, target.port) {
            (_, Some(port)) => format!("MSSQLSvc/{}:{port}", target.host),
            (Some(instance), None) => format!("MSSQLSvc/{}:{instance}", target.host),
            (None, None) => format!("MSSQLSvc/{}", target.host),
        }
    }

    /// The name as the user supplied it.
    #[must_use]
    pub fn user_supplied_name(&self) -> &str {
        &self.user_supplied_name
    }

    /// Host actually connected to. Empty means no name.
    #[must_use]
    pub fn resolved_name(&self) -> &str {
        &self.resolved_name
    }

    /// Resolved name with its transport prefix, e.g. `tcp:host`.
    #[must_use]
    pub fn extended_name(&self) -> String {
        match self.transport_qualifier {
            Some(qualifier) => format!("{qualifier}:{}", self.resolved_name),
            None => self.resolved_name.clone(),
        }
    }

    /// Transport prefix.
    #[must_use]
    pub fn transport_qualifier(&self) -> Option<TransportQualifier> {
        self.transport_qualifier
    }

    /// Explicit port.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Named instance.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Service principal name used for integrated authentication.
    #[must_use]
    pub fn service_principal_name(&self) -> Option<&str> {
        self.service_principal_name.as_deref()
    }

    /// Database to open after login.
    #[must_use]
    pub fn resolved_database(&self) -> Option<&str> {
        self.resolved_database.as_deref()
    }

    /// Resolved name of the gateway that issued the redirect, for routed identities.
    #[must_use]
    pub fn pre_routing_name(&self) -> Option<&str> {
        self.pre_routing_name.as_deref()
    }

    /// Whether this identity came from a routing response.
    #[must_use]
    pub fn is_routed(&self) -> bool {
        self.pre_routing_name.is_some()
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.extended_name())?;
        if let Some(port) = self.port {
            write!(f, ",{port}")?;
        }
        Ok(())
    }
}
