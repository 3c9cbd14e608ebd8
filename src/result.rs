//! Operation results, errors and helpers.
//!
//! Directory operations return an [`LdapResult`](struct.LdapResult.html), which
//! carries the numeric result code alongside the matched DN, diagnostic text,
//! referrals and response controls. Everything else that can go wrong, from a
//! refused TCP connection to an exhausted pool, is an [`LdapError`](enum.LdapError.html).
//!
//! `LdapError` is `Clone`, since a completed [`ResponseFuture`](../struct.ResponseFuture.html)
//! must be able to hand out the same failure to every caller of `get()`.

use std::error::Error;
use std::fmt;
use std::io;
use std::result::Result as StdResult;
use std::sync::Arc;

use crate::controls::RawControl;
use crate::exop::Exop;
use crate::RequestId;

use thiserror::Error;

/// Type alias for the standard `Result` with the fixed `LdapError` error part.
pub type Result<T> = std::result::Result<T, LdapError>;

/// Error variants recognized by the library.
#[derive(Clone, Debug, Error)]
pub enum LdapError {
    /// No path given for a `ldapi://` URL.
    #[error("empty Unix domain socket path")]
    EmptyUnixPath,

    /// A `ldapi://` URL contains a port spec, which it shouldn't.
    #[error("the port must be empty in the ldapi scheme")]
    PortInUnixPath,

    /// Encapsulated I/O error.
    #[error("I/O error: {source}")]
    Io { source: Arc<io::Error> },

    /// URL parsing error.
    #[error("url parse error: {source}")]
    UrlParsing {
        #[from]
        source: url::ParseError,
    },

    /// Unknown LDAP URL scheme.
    #[error("unknown LDAP URL scheme: {0}")]
    UnknownScheme(String),

    #[cfg(feature = "tls")]
    /// TLS library error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection establishment didn't finish in the allotted time.
    #[error("connection timeout")]
    ConnectTimeout,

    /// Error parsing the string representation of a search filter.
    #[error("filter parse error")]
    FilterParsing,

    /// A protocol message couldn't be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The I/O driver of the connection has exited.
    #[error("connection closed")]
    ConnectionClosed,

    /// Premature end of a response stream, or reading past its end.
    #[error("premature end of search stream")]
    EndOfStream,

    /// LDAP operation result with an error return code.
    #[error("LDAP operation result: {result}")]
    LdapResult {
        #[from]
        result: LdapResult,
    },

    /// Bind failed while creating or re-binding a connection. The connection
    /// has been closed.
    #[error("authentication failed: {result}")]
    AuthenticationFailed { result: LdapResult },

    /// A pooled connection couldn't be brought back into a usable state.
    #[error("connection reactivation failed: {source}")]
    ReactivationFailed { source: Box<LdapError> },

    /// A connection didn't pass validation.
    #[error("connection failed validation")]
    ValidationFailed,

    /// No connection could be obtained within the pool bound.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A freshly created connection failed activation or validation.
    #[error("unable to borrow a connection: {source}")]
    BorrowFailed { source: Box<LdapError> },

    /// Pool accounting inconsistency, such as releasing an unknown connection.
    #[error("pool internal error: {0}")]
    PoolInternalError(String),

    /// The pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// No response arrived before the operation timeout expired. The
    /// operation has been abandoned.
    #[error("timeout waiting for response to operation {id}")]
    ResponseTimeout { id: RequestId },

    /// The operation was cancelled before its response was delivered.
    #[error("operation {id} cancelled")]
    OperationCancelled { id: RequestId },

    /// A search cursor failed while advancing and has been closed.
    #[error("search cursor failed: {source}")]
    CursorBroken { source: Box<LdapError> },

    /// The cursor isn't positioned on a response.
    #[error("cursor is not positioned on a response")]
    InvalidPosition,

    /// The current response is a referral, not an entry.
    #[error("referral: {urls:?}")]
    Referral { urls: Vec<String> },

    /// The current response is neither an entry nor a referral.
    #[error("current response is not an entry")]
    NotAnEntry,

    /// The operation is not supported by a forward-only cursor.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The server rejected the password, possibly with a password policy error.
    #[error("password rejected: {result}")]
    PasswordRejected {
        result: LdapResult,
        policy_error: Option<crate::password_policy::PasswordPolicyError>,
    },
}

impl From<io::Error> for LdapError {
    fn from(e: io::Error) -> LdapError {
        LdapError::Io {
            source: Arc::new(e),
        }
    }
}

impl From<LdapError> for io::Error {
    fn from(le: LdapError) -> io::Error {
        match le {
            LdapError::Io { source } => io::Error::new(source.kind(), source.to_string()),
            _ => io::Error::new(io::ErrorKind::Other, format!("{}", le)),
        }
    }
}

impl LdapError {
    /// True if the error is a response timeout, possibly wrapped by a cursor or pool error.
    pub fn is_timeout(&self) -> bool {
        match self {
            LdapError::ResponseTimeout { .. } | LdapError::ConnectTimeout => true,
            LdapError::CursorBroken { source }
            | LdapError::BorrowFailed { source }
            | LdapError::ReactivationFailed { source } => source.is_timeout(),
            _ => false,
        }
    }

    /// True if the error is a cancellation, possibly wrapped by a cursor error.
    pub fn is_cancelled(&self) -> bool {
        match self {
            LdapError::OperationCancelled { .. } => true,
            LdapError::CursorBroken { source } => source.is_cancelled(),
            _ => false,
        }
    }

    /// True if repeating the operation on another connection could succeed.
    ///
    /// Transport failures and timeouts are retryable; protocol results, bad
    /// arguments and cursor misuse are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LdapError::Io { .. }
            | LdapError::ConnectionClosed
            | LdapError::ConnectTimeout
            | LdapError::ResponseTimeout { .. }
            | LdapError::PoolExhausted => true,
            LdapError::CursorBroken { source }
            | LdapError::BorrowFailed { source }
            | LdapError::ReactivationFailed { source } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Common components of an LDAP operation result.
///
/// The structure mirrors the LDAPResult of RFC 4511. Helper methods
/// [`success()`](#method.success) and [`non_error()`](#method.non_error)
/// turn it into a `Result` when simple condition checking suffices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LdapResult {
    /// Result code.
    ///
    /// See [Section A.1 of RFC 4511](https://tools.ietf.org/html/rfc4511#appendix-A.1).
    pub rc: u32,
    /// Matched component DN, where applicable.
    pub matched: String,
    /// Additional diagnostic text.
    pub text: String,
    /// Referrals. Absence of referrals is represented by an empty vector.
    pub refs: Vec<String>,
    /// Response controls.
    pub ctrls: Vec<RawControl>,
}

impl Error for LdapResult {}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        write!(
            f,
            "rc={} ({}), dn: \"{}\", text: \"{}\"",
            self.rc,
            rc_name(self.rc),
            self.matched,
            self.text
        )
    }
}

fn rc_name(rc: u32) -> &'static str {
    match rc {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        3 => "timeLimitExceeded",
        4 => "sizeLimitExceeded",
        5 => "compareFalse",
        6 => "compareTrue",
        7 => "authMethodNotSupported",
        8 => "strongerAuthRequired",
        10 => "referral",
        11 => "adminLimitExceeded",
        12 => "unavailableCriticalExtension",
        13 => "confidentialityRequired",
        14 => "saslBindInProgress",
        16 => "noSuchAttribute",
        17 => "undefinedAttributeType",
        18 => "inappropriateMatching",
        19 => "constraintViolation",
        20 => "attributeOrValueExists",
        21 => "invalidAttributeSyntax",
        32 => "noSuchObject",
        33 => "aliasProblem",
        34 => "invalidDNSyntax",
        36 => "aliasDereferencingProblem",
        48 => "inappropriateAuthentication",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        54 => "loopDetect",
        64 => "namingViolation",
        65 => "objectClassViolation",
        66 => "notAllowedOnNonLeaf",
        67 => "notAllowedOnRDN",
        68 => "entryAlreadyExists",
        69 => "objectClassModsProhibited",
        71 => "affectsMultipleDSAs",
        80 => "other",
        88 => "abandoned",
        122 => "assertionFailed",
        _ => "unknown",
    }
}

impl LdapResult {
    /// If the result code is zero, return the instance itself wrapped
    /// in `Ok()`, otherwise wrap the instance in an `LdapError`.
    pub fn success(self) -> Result<Self> {
        if self.rc == 0 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// If the result code is 0 or 10 (referral), return the instance
    /// itself wrapped in `Ok()`, otherwise wrap the instance in an
    /// `LdapError`.
    pub fn non_error(self) -> Result<Self> {
        if self.rc == 0 || self.rc == 10 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }
}

/// Wrapper for the result of an Extended operation.
///
/// [`success()`](#method.success) and [`non_error()`](#method.non_error)
/// destructure the wrapper into an anonymous tuple of its components.
#[derive(Clone, Debug)]
pub struct ExopResult(pub Exop, pub LdapResult);

impl ExopResult {
    /// If the result code is zero, return an anonymous tuple of component structs
    /// wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn success(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 || self.1.rc == 10 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}
