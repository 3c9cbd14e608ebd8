use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::conn::LdapConnSettings;
use crate::ldap::{ConnectionId, LdapConnection, DEFAULT_TIMEOUT};
use crate::result::{LdapError, Result};
use crate::sasl::Credentials;
use crate::search::{BinaryAttributeDetector, DefaultBinaryAttributeDetector};

use serde::Deserialize;
use tokio::runtime::{Builder, Runtime};

/// Producer of ready-to-use connections.
///
/// A factory applies the connection setup policy: where to connect, which
/// operation timeout and binary attribute detector to use, and which
/// credentials to authenticate with.
pub trait ConnectionFactory: Debug + Send + Sync {
    /// Open a configured, unauthenticated connection.
    fn new_unbound(&self) -> Result<LdapConnection>;

    /// Apply the timeout and the binary attribute detector. Applying the
    /// configuration again changes nothing.
    fn configure_connection(&self, conn: LdapConnection) -> LdapConnection;

    /// Credentials used by [`authenticate()`](#tymethod.authenticate).
    fn credentials(&self) -> &Credentials;

    /// Default operation timeout of the connections.
    fn timeout(&self) -> Option<Duration>;

    /// Bind `conn` with the configured credentials.
    ///
    /// A Bind rejected by the server is `AuthenticationFailed`; transport
    /// failures are returned as they are.
    fn authenticate(&self, conn: &mut LdapConnection) -> Result<()> {
        let result = conn.bind(self.credentials())?;
        if result.rc != 0 {
            return Err(LdapError::AuthenticationFailed { result });
        }
        Ok(())
    }

    /// Authenticate a connection, closing it if that fails.
    fn bind_connection(&self, mut conn: LdapConnection) -> Result<LdapConnection> {
        match self.authenticate(&mut conn) {
            Ok(()) => Ok(conn),
            Err(e) => {
                debug!("closing connection {} after failed bind: {}", conn.id(), e);
                conn.close();
                Err(e)
            }
        }
    }

    /// Open, configure and authenticate a connection.
    fn new_connection(&self) -> Result<LdapConnection> {
        let conn = self.new_unbound()?;
        self.bind_connection(conn)
    }

    /// Re-establish the transport of a connection whose driver is gone.
    fn reconnect(&self, conn: &mut LdapConnection) -> Result<()> {
        conn.reconnect()
    }
}

/// Configuration of a [`DefaultConnectionFactory`](struct.DefaultConnectionFactory.html).
///
/// The structure can be deserialized from a configuration file, where
/// the operation timeout is given in milliseconds as `timeout_ms`, and the
/// transport settings form the `connection` table:
///
/// ```toml
/// url = "ldap://ldap.example.org"
/// bind_dn = "cn=service,dc=example,dc=org"
/// bind_password = "secret"
/// timeout_ms = 10000
/// binary_attributes = ["msExchArchiveGUID"]
///
/// [connection]
/// connect_timeout_ms = 2000
/// ```
///
/// A SASL mechanism or a custom binary attribute detector can only be
/// supplied in code.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LdapConnectionConfig {
    url: String,
    bind_dn: Option<String>,
    bind_password: Option<String>,
    #[serde(rename = "timeout_ms", with = "crate::config::opt_millis")]
    timeout: Option<Duration>,
    binary_attributes: Vec<String>,
    #[serde(rename = "connection")]
    settings: LdapConnSettings,
    #[serde(skip)]
    credentials: Option<Credentials>,
    #[serde(skip)]
    detector: Option<Arc<dyn BinaryAttributeDetector>>,
}

impl Default for LdapConnectionConfig {
    fn default() -> Self {
        LdapConnectionConfig {
            url: String::from("ldap://localhost"),
            bind_dn: None,
            bind_password: None,
            timeout: Some(DEFAULT_TIMEOUT),
            binary_attributes: vec![],
            settings: LdapConnSettings::new(),
            credentials: None,
            detector: None,
        }
    }
}

impl LdapConnectionConfig {
    pub fn new<S: Into<String>>(url: S) -> Self {
        LdapConnectionConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Authenticate with `credentials` instead of the configured bind DN
    /// and password.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the default operation timeout; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_settings(mut self, settings: LdapConnSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `detector` instead of the default binary attribute detector.
    pub fn with_binary_detector(mut self, detector: Arc<dyn BinaryAttributeDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Treat `attrs` as binary, in addition to the well-known binary attributes.
    pub fn with_binary_attributes<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.binary_attributes.extend(attrs.into_iter().map(Into::into));
        self
    }

    pub fn credentials(&self) -> Credentials {
        if let Some(ref credentials) = self.credentials {
            return credentials.clone();
        }
        match self.bind_dn {
            Some(ref dn) => Credentials::simple(dn.clone(), self.bind_password.clone().unwrap_or_default()),
            None => Credentials::Anonymous,
        }
    }

    fn detector(&self) -> Arc<dyn BinaryAttributeDetector> {
        match self.detector {
            Some(ref detector) => detector.clone(),
            None => Arc::new(
                DefaultBinaryAttributeDetector::new().with_attributes(&self.binary_attributes),
            ),
        }
    }
}

/// Factory connecting to a single LDAP server.
///
/// The factory owns the runtime on which the I/O drivers of its connections
/// run, and assigns each connection a unique identity.
#[derive(Debug)]
pub struct DefaultConnectionFactory {
    url: String,
    settings: LdapConnSettings,
    timeout: Option<Duration>,
    credentials: Credentials,
    detector: Arc<dyn BinaryAttributeDetector>,
    rt: Arc<Runtime>,
    next_id: AtomicU64,
}

impl DefaultConnectionFactory {
    /// Create a factory with its own I/O runtime.
    pub fn new(config: LdapConnectionConfig) -> Result<Self> {
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ldap-io")
            .enable_all()
            .build()?;
        Ok(Self::with_runtime(config, Arc::new(rt)))
    }

    /// Create a factory whose connections run on `rt`.
    pub fn with_runtime(config: LdapConnectionConfig, rt: Arc<Runtime>) -> Self {
        DefaultConnectionFactory {
            credentials: config.credentials(),
            detector: config.detector(),
            url: config.url,
            settings: config.settings,
            timeout: config.timeout,
            rt,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn new_unbound(&self) -> Result<LdapConnection> {
        let conn = LdapConnection::connect(
            self.next_id(),
            &self.url,
            self.settings.clone(),
            self.rt.clone(),
        )?;
        Ok(self.configure_connection(conn))
    }

    fn configure_connection(&self, mut conn: LdapConnection) -> LdapConnection {
        conn.set_timeout(self.timeout);
        conn.set_binary_detector(self.detector.clone());
        conn
    }

    fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
