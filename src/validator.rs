//! Connection health checks used by the pool.

use std::fmt::Debug;
use std::time::Duration;

use crate::ldap::LdapConnection;
use crate::search::Scope;

/// Policy deciding whether a connection is fit for use.
///
/// A validator never fails: any error during the check means the
/// connection is invalid.
pub trait ConnectionValidator: Debug + Send + Sync {
    fn validate(&self, conn: &mut LdapConnection) -> bool;
}

/// Checks the connection flags, then reads the root DSE.
#[derive(Clone, Debug, Default)]
pub struct LookupValidator {
    timeout: Option<Duration>,
}

impl LookupValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the lookup by `timeout` instead of the connection default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ConnectionValidator for LookupValidator {
    fn validate(&self, conn: &mut LdapConnection) -> bool {
        if !conn.is_connected() || !conn.is_authenticated() {
            return false;
        }
        if let Some(timeout) = self.timeout {
            conn.with_timeout(timeout);
        }
        let mut cursor = match conn.search("", Scope::Base, "(objectClass=*)", ["1.1"]) {
            Ok(cursor) => cursor,
            Err(e) => {
                debug!("validation of connection {} failed: {}", conn.id(), e);
                return false;
            }
        };
        loop {
            match cursor.next() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    debug!("validation of connection {} failed: {}", conn.id(), e);
                    return false;
                }
            }
        }
        matches!(cursor.result(), Some(res) if res.rc == 0)
    }
}

/// Checks only that the connection is open and authenticated, without a
/// round trip to the server.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlagValidator;

impl ConnectionValidator for FlagValidator {
    fn validate(&self, conn: &mut LdapConnection) -> bool {
        conn.is_connected() && conn.is_authenticated()
    }
}
