//! Scripted connector and transport.
//!
//! A [`MockConnector`] hands out one [`MockLogin`] per connect, taken from a
//! per-host queue, then from a shared queue, then from a fallback. Everything
//! the engine sends is written to a [`Journal`] the test can inspect.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_testing::{MockConnector, MockLogin, tokens};
//!
//! let connector = MockConnector::new()
//!     .then(MockLogin::refuse())
//!     .then(MockLogin::respond(vec![tokens::routing("replica", 11000, None), tokens::done()]))
//!     .on_host("replica", MockLogin::success());
//! let journal = connector.journal();
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mssql_connect::{
    Connector, Error, HandshakeAck, LoginRequest, PreLoginRequest, Result, ServerIdentity,
    TokenRecord, Transport,
};
use parking_lot::Mutex;
use tds_protocol::TdsVersion;
use thiserror::Error;

use crate::tokens;

/// Failures raised by the scripted transport itself.
#[derive(Debug, Error)]
pub enum MockTransportError {
    /// The script refused the connection.
    #[error("connection to {0} refused by script")]
    Refused(String),

    /// The engine used the transport after disconnecting it.
    #[error("transport used after disconnect")]
    Disconnected,
}

impl From<MockTransportError> for Error {
    fn from(e: MockTransportError) -> Self {
        let kind = match e {
            MockTransportError::Refused(_) => std::io::ErrorKind::ConnectionRefused,
            MockTransportError::Disconnected => std::io::ErrorKind::NotConnected,
        };
        std::io::Error::new(kind, e).into()
    }
}

/// How one connect attempt plays out.
#[derive(Debug, Clone)]
pub enum MockLogin {
    /// Fail the connect.
    Refuse,
    /// Never complete the connect.
    Hang,
    /// Accept the connection and answer the login with `records`.
    ///
    /// With `stall` set, reads past the last record never complete;
    /// otherwise they report a closed stream.
    Respond {
        /// Records returned in order.
        records: Vec<TokenRecord>,
        /// Whether to hang once the records run out.
        stall: bool,
    },
}

impl MockLogin {
    /// Refuse the connection.
    pub fn refuse() -> Self {
        Self::Refuse
    }

    /// Answer with exactly these records.
    pub fn respond(records: Vec<TokenRecord>) -> Self {
        Self::Respond {
            records,
            stall: false,
        }
    }

    /// Answer with these records, then go silent.
    pub fn stall_after(records: Vec<TokenRecord>) -> Self {
        Self::Respond {
            records,
            stall: true,
        }
    }

    /// A plain successful TDS 7.4 login.
    pub fn success() -> Self {
        Self::success_with(Vec::new())
    }

    /// A successful login carrying `records` ahead of LOGINACK.
    pub fn success_with(mut records: Vec<TokenRecord>) -> Self {
        records.push(tokens::login_ack(TdsVersion::V7_4));
        records.push(tokens::done());
        Self::respond(records)
    }

    /// Redirect the login to `server:port`.
    pub fn route_to(server: &str, port: u16) -> Self {
        Self::respond(vec![tokens::routing(server, port, None), tokens::done()])
    }

    /// Fail the login with a server error.
    pub fn server_error(number: i32, class: u8, message: &str) -> Self {
        Self::respond(vec![
            tokens::error(number, class, message),
            tokens::done_error(),
        ])
    }
}

/// One connect call as the connector saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    /// Host the engine connected to.
    pub host: String,
    /// Port, if the identity carried one.
    pub port: Option<u16>,
    /// Attempt timeout handed to the connector.
    pub timeout: Option<Duration>,
}

/// Everything the engine sent through the mock.
#[derive(Debug, Default)]
pub struct Journal {
    connects: Mutex<Vec<ConnectRecord>>,
    handshakes: Mutex<Vec<PreLoginRequest>>,
    logins: Mutex<Vec<LoginRequest>>,
    fed_auth_tokens: Mutex<Vec<Vec<u8>>>,
    disconnects: Mutex<usize>,
}

impl Journal {
    /// Connect calls, oldest first.
    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.connects.lock().clone()
    }

    /// Hosts connected to, oldest first.
    pub fn hosts(&self) -> Vec<String> {
        self.connects.lock().iter().map(|c| c.host.clone()).collect()
    }

    /// Number of connect calls.
    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    /// PRELOGIN requests, oldest first.
    pub fn handshakes(&self) -> Vec<PreLoginRequest> {
        self.handshakes.lock().clone()
    }

    /// LOGIN7 requests, oldest first.
    pub fn logins(&self) -> Vec<LoginRequest> {
        self.logins.lock().clone()
    }

    /// Federated tokens sent, as UTF-16LE bytes.
    pub fn fed_auth_tokens(&self) -> Vec<Vec<u8>> {
        self.fed_auth_tokens.lock().clone()
    }

    /// Federated tokens sent, decoded.
    pub fn fed_auth_token_strings(&self) -> Vec<String> {
        self.fed_auth_tokens
            .lock()
            .iter()
            .map(|bytes| {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            })
            .collect()
    }

    /// Number of transports closed by the engine.
    pub fn disconnects(&self) -> usize {
        *self.disconnects.lock()
    }
}

#[derive(Debug, Default)]
struct Script {
    by_host: HashMap<String, VecDeque<MockLogin>>,
    queue: VecDeque<MockLogin>,
}

/// A [`Connector`] that plays back scripted logins.
#[derive(Debug)]
pub struct MockConnector {
    script: Mutex<Script>,
    fallback: MockLogin,
    journal: Arc<Journal>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Create a connector that refuses everything until scripted.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            fallback: MockLogin::Refuse,
            journal: Arc::new(Journal::default()),
        }
    }

    /// Queue a login for the next connect to any host.
    pub fn then(self, login: MockLogin) -> Self {
        self.script.lock().queue.push_back(login);
        self
    }

    /// Queue a login for the next connect to `host`.
    ///
    /// Host queues take precedence over the shared queue.
    pub fn on_host(self, host: impl Into<String>, login: MockLogin) -> Self {
        self.script
            .lock()
            .by_host
            .entry(host.into().to_ascii_lowercase())
            .or_default()
            .push_back(login);
        self
    }

    /// Play `login` once the queues are empty.
    pub fn otherwise(mut self, login: MockLogin) -> Self {
        self.fallback = login;
        self
    }

    /// The journal shared with every transport this connector opens.
    pub fn journal(&self) -> Arc<Journal> {
        Arc::clone(&self.journal)
    }

    fn next_login(&self, host: &str) -> MockLogin {
        let mut script = self.script.lock();
        if let Some(login) = script
            .by_host
            .get_mut(&host.to_ascii_lowercase())
            .and_then(VecDeque::pop_front)
        {
            return login;
        }
        script
            .queue
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &ServerIdentity,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Transport>> {
        let host = target.resolved_name().to_string();
        self.journal.connects.lock().push(ConnectRecord {
            host: host.clone(),
            port: target.port(),
            timeout,
        });
        tracing::trace!(host = %host, "mock connect");

        match self.next_login(&host) {
            MockLogin::Refuse => Err(MockTransportError::Refused(host).into()),
            MockLogin::Hang => std::future::pending().await,
            MockLogin::Respond { records, stall } => Ok(Box::new(MockTransport {
                records: records.into(),
                stall,
                open: true,
                journal: Arc::clone(&self.journal),
            })),
        }
    }
}

/// A transport replaying one scripted login response.
#[derive(Debug)]
pub struct MockTransport {
    records: VecDeque<TokenRecord>,
    stall: bool,
    open: bool,
    journal: Arc<Journal>,
}

impl MockTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(MockTransportError::Disconnected.into())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_handshake(&mut self, request: &PreLoginRequest) -> Result<HandshakeAck> {
        self.ensure_open()?;
        self.journal.handshakes.lock().push(request.clone());
        Ok(HandshakeAck {
            encryption: request.encrypt,
            fed_auth_required: request.fed_auth_required,
        })
    }

    async fn send_login(&mut self, request: &LoginRequest) -> Result<()> {
        self.ensure_open()?;
        self.journal.logins.lock().push(request.clone());
        Ok(())
    }

    async fn read_next_record(&mut self) -> Result<Option<TokenRecord>> {
        self.ensure_open()?;
        match self.records.pop_front() {
            Some(record) => Ok(Some(record)),
            None if self.stall => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn send_fed_auth_token(&mut self, token: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.journal.fed_auth_tokens.lock().push(token.to_vec());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open
    }

    fn has_pending_data(&self) -> bool {
        false
    }

    async fn disconnect(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.open, false) {
            *self.journal.disconnects.lock() += 1;
        }
        Ok(())
    }
}
