//! Pooled, synchronous LDAP connections.
//!
//! ## Summary
//!
//! The library manages the client side of LDAP sessions for applications
//! which use many of them concurrently. An [`LdapConnection`](struct.LdapConnection.html)
//! is a blocking handle to one session. Its socket is owned by an I/O driver
//! running on a Tokio runtime; every request gets a fresh message ID, and the
//! driver routes the responses to the right caller, through a
//! [`ResponseFuture`](struct.ResponseFuture.html) for single-response operations,
//! or a [`SearchFuture`](struct.SearchFuture.html) for searches. Each wait is
//! bounded by the operation timeout, and an operation which times out is
//! abandoned on the server.
//!
//! Connections are created by a [`ConnectionFactory`](trait.ConnectionFactory.html),
//! and reused through a bounded [`Pool`](pool/struct.Pool.html). The
//! [`PoolableConnectionFactory`](struct.PoolableConnectionFactory.html) adapts a
//! factory to the pool lifecycle: it reconnects and re-binds connections which
//! lost their transport or identity, and checks their health with a
//! [`ConnectionValidator`](trait.ConnectionValidator.html).
//!
//! Search results are read with a forward-only [`SearchCursor`](struct.SearchCursor.html),
//! which turns entries into [`SearchEntry`](struct.SearchEntry.html) structures,
//! separating binary attribute values from textual ones with a
//! [`BinaryAttributeDetector`](trait.BinaryAttributeDetector.html).
//!
//! The documentation is written for readers familiar with LDAP concepts and terminology,
//! which it won't attempt to explain.
//!
//! ## Compile-time features
//!
//! * __tls__ (disabled by default): TLS support, backed by the `native-tls` crate, which uses
//!   a platform-specific TLS backend. Enables `ldaps://` URLs and StartTLS.
//!
//! Without any features, only plain TCP connections (and Unix domain sockets on Unix-like
//! platforms) are available.
//!
//! ## Logging
//!
//! The library logs through the `log` facade and installs no logger of its own.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ldap3_pool::pool::{Pool, PoolConfig};
//! use ldap3_pool::result::Result;
//! use ldap3_pool::{
//!     Credentials, DefaultConnectionFactory, LdapConnectionConfig, PoolableConnectionFactory,
//!     Scope,
//! };
//!
//! fn main() -> Result<()> {
//!     let config = LdapConnectionConfig::new("ldap://localhost:2389")
//!         .with_credentials(Credentials::simple("cn=admin,dc=example,dc=org", "secret"));
//!     let factory = DefaultConnectionFactory::new(config)?;
//!     let pool = Pool::new(PoolableConnectionFactory::new(factory), PoolConfig::new());
//!     let mut conn = pool.borrow()?;
//!     let cursor = conn.search(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::Subtree,
//!         "(&(objectClass=locality)(l=ma*))",
//!         vec!["l"],
//!     )?;
//!     for entry in cursor {
//!         println!("{:?}", entry?);
//!     }
//!     Ok(())
//! }
//! ```

#[doc(hidden)]
#[macro_use]
pub extern crate log;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

mod config;
mod conn;
pub mod controls;
mod cursor;
pub mod exop;
mod factory;
mod future;
mod ldap;
pub mod password_policy;
pub mod pool;
mod poolable;
mod protocol;
pub mod result;
mod sasl;
mod search;
#[cfg(test)]
mod test_support;
mod validator;

pub use conn::LdapConnSettings;
pub use cursor::{EntryIter, SearchCursor};
pub use factory::{ConnectionFactory, DefaultConnectionFactory, LdapConnectionConfig};
pub use future::{ResponseFuture, SearchFuture};
pub use ldap::{ConnectionId, LdapConnection, DEFAULT_TIMEOUT};
pub use ldap3::parse_filter;
pub use poolable::PoolableConnectionFactory;
pub use protocol::{Message, Response, ResponseKind};
pub use result::{LdapError, LdapResult};
pub use sasl::{Credentials, External, Plain, SaslMechanism};
pub use search::parse_refs;
pub use search::{
    BinaryAttributeDetector, DefaultBinaryAttributeDetector, DerefAliases, ResultEntry, Scope,
    SearchEntry, SearchOptions,
};
pub use validator::{ConnectionValidator, FlagValidator, LookupValidator};
