//! Bind credentials and SASL mechanisms.
//!
//! A [`ConnectionFactory`](../trait.ConnectionFactory.html) authenticates its
//! connections with [`Credentials`](enum.Credentials.html). SASL negotiation is
//! delegated to an implementation of [`SaslMechanism`](trait.SaslMechanism.html),
//! which the connection drives through the saslBindInProgress exchange.

use std::fmt;
use std::sync::Arc;

use crate::result::{LdapError, Result};

/// Client side of a SASL mechanism.
pub trait SaslMechanism: fmt::Debug + Send + Sync {
    /// Registered name of the mechanism, e.g. `EXTERNAL`.
    fn name(&self) -> &str;

    /// Credentials sent with the first Bind request, if any.
    fn initial_response(&self) -> Result<Option<Vec<u8>>>;

    /// Answer a server challenge received with saslBindInProgress.
    fn step(&self, challenge: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// SASL EXTERNAL, relying on the identity established by the transport:
/// a TLS client certificate or the peer credentials of a Unix domain socket.
/// The authorization identity is left empty.
#[derive(Clone, Debug, Default)]
pub struct External;

impl SaslMechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn initial_response(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(Vec::new()))
    }

    fn step(&self, _challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(LdapError::UnsupportedOperation("EXTERNAL challenge"))
    }
}

/// SASL PLAIN ([RFC 4616](https://tools.ietf.org/html/rfc4616)).
///
/// Sends the password in the clear; use it only over a secured transport.
#[derive(Clone)]
pub struct Plain {
    authzid: String,
    authcid: String,
    password: String,
}

impl Plain {
    pub fn new<S: Into<String>>(authcid: S, password: S) -> Plain {
        Plain {
            authzid: String::new(),
            authcid: authcid.into(),
            password: password.into(),
        }
    }

    /// Act as `authzid` after authenticating.
    pub fn with_authzid<S: Into<String>>(mut self, authzid: S) -> Plain {
        self.authzid = authzid.into();
        self
    }
}

impl fmt::Debug for Plain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Plain")
            .field("authzid", &self.authzid)
            .field("authcid", &self.authcid)
            .finish_non_exhaustive()
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&self) -> Result<Option<Vec<u8>>> {
        let mut creds =
            Vec::with_capacity(self.authzid.len() + self.authcid.len() + self.password.len() + 2);
        creds.extend_from_slice(self.authzid.as_bytes());
        creds.push(0);
        creds.extend_from_slice(self.authcid.as_bytes());
        creds.push(0);
        creds.extend_from_slice(self.password.as_bytes());
        Ok(Some(creds))
    }

    fn step(&self, _challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(LdapError::UnsupportedOperation("PLAIN challenge"))
    }
}

/// Identity used to authenticate connections.
#[derive(Clone, Default)]
pub enum Credentials {
    /// Anonymous simple Bind.
    #[default]
    Anonymous,
    /// Simple Bind with a DN and password.
    Simple { dn: String, password: String },
    /// SASL Bind with the given mechanism.
    Sasl(Arc<dyn SaslMechanism>),
}

impl Credentials {
    pub fn simple<S: Into<String>>(dn: S, password: S) -> Credentials {
        Credentials::Simple {
            dn: dn.into(),
            password: password.into(),
        }
    }

    pub fn sasl<M: SaslMechanism + 'static>(mech: M) -> Credentials {
        Credentials::Sasl(Arc::new(mech))
    }

    /// The DN a successful Bind with these credentials leaves on the
    /// connection, as reported by `LdapConnection::bound_identity()`.
    pub fn identity(&self) -> Option<&str> {
        match self {
            Credentials::Simple { dn, .. } if !dn.is_empty() => Some(dn),
            _ => None,
        }
    }

    /// True if both hold the same secrets. SASL credentials match only the
    /// same mechanism instance.
    pub(crate) fn same_as(&self, other: &Credentials) -> bool {
        match (self, other) {
            (Credentials::Anonymous, Credentials::Anonymous) => true,
            (
                Credentials::Simple { dn, password },
                Credentials::Simple {
                    dn: other_dn,
                    password: other_password,
                },
            ) => dn == other_dn && password == other_password,
            (Credentials::Sasl(mech), Credentials::Sasl(other_mech)) => Arc::ptr_eq(mech, other_mech),
            _ => false,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Simple { dn, .. } => f
                .debug_struct("Simple")
                .field("dn", dn)
                .finish_non_exhaustive(),
            Credentials::Sasl(mech) => f.debug_tuple("Sasl").field(&mech.name()).finish(),
        }
    }
}
