use std::sync::Arc;

use crate::factory::ConnectionFactory;
use crate::ldap::LdapConnection;
use crate::pool::ManageConnection;
use crate::result::{LdapError, Result};
use crate::validator::{ConnectionValidator, LookupValidator};

/// Pool lifecycle of LDAP connections, built on a [`ConnectionFactory`](trait.ConnectionFactory.html).
///
/// Activation reconnects a connection whose transport is gone and re-binds
/// an unauthenticated one. Validation is delegated to a
/// [`ConnectionValidator`](trait.ConnectionValidator.html), by default the
/// root DSE lookup. Destruction unbinds.
///
/// Passivation does nothing, unless the instance is created with
/// [`validating()`](#method.validating): then a connection which the borrower
/// re-bound with another identity is bound again with the factory credentials
/// before it goes back to the idle set.
#[derive(Debug)]
pub struct PoolableConnectionFactory<F: ConnectionFactory> {
    factory: F,
    validator: Arc<dyn ConnectionValidator>,
    restore_on_passivate: bool,
}

impl<F: ConnectionFactory> PoolableConnectionFactory<F> {
    pub fn new(factory: F) -> Self {
        PoolableConnectionFactory {
            factory,
            validator: Arc::new(LookupValidator::new()),
            restore_on_passivate: false,
        }
    }

    /// Create an instance which restores the factory identity of every
    /// returned connection.
    pub fn validating(factory: F) -> Self {
        PoolableConnectionFactory {
            restore_on_passivate: true,
            ..Self::new(factory)
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ConnectionValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Bind `conn` with the factory credentials, unless its last Bind
    /// already used them. A closed connection is left alone.
    pub fn restore_identity(&self, conn: &mut LdapConnection) -> Result<()> {
        if !conn.is_connected() || conn.is_bound_with(self.factory.credentials()) {
            return Ok(());
        }
        debug!("restoring the identity of connection {}", conn.id());
        self.factory.authenticate(conn)
    }

    fn reactivate(&self, conn: &mut LdapConnection) -> Result<()> {
        if !conn.is_connected() {
            debug!("reconnecting connection {}", conn.id());
            self.factory.reconnect(conn)?;
        }
        if !conn.is_authenticated() {
            self.factory.authenticate(conn)?;
        }
        Ok(())
    }
}

impl<F: ConnectionFactory + 'static> ManageConnection for PoolableConnectionFactory<F> {
    type Connection = LdapConnection;

    fn make(&self) -> Result<LdapConnection> {
        self.factory.new_connection()
    }

    fn activate(&self, conn: &mut LdapConnection) -> Result<()> {
        self.reactivate(conn).map_err(|e| LdapError::ReactivationFailed {
            source: Box::new(e),
        })
    }

    fn validate(&self, conn: &mut LdapConnection) -> bool {
        self.validator.validate(conn)
    }

    fn passivate(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.restore_on_passivate {
            self.restore_identity(conn)?;
        }
        Ok(())
    }

    fn destroy(&self, mut conn: LdapConnection) {
        if !conn.is_connected() {
            return;
        }
        if let Err(e) = conn.unbind() {
            warn!("unbind of connection {} failed: {}", conn.id(), e);
        }
    }

    fn id(&self, conn: &LdapConnection) -> u64 {
        conn.id()
    }
}
