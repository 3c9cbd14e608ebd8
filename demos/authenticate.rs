// Demonstrates checking user passwords on pooled connections,
// with the password policy control.
//
// The pool binds its connections with the service account, and
// re-binds a connection with it after each check.

use ldap3_pool::password_policy::PasswordWarning;
use ldap3_pool::pool::{Pool, PoolConfig};
use ldap3_pool::result::Result;
use ldap3_pool::{
    Credentials, DefaultConnectionFactory, LdapConnectionConfig, LdapError,
    PoolableConnectionFactory,
};

fn main() -> Result<()> {
    env_logger::init();
    let config = LdapConnectionConfig::new("ldap://localhost:2389")
        .with_credentials(Credentials::simple("cn=Manager,dc=example,dc=org", "secret"));
    let factory = DefaultConnectionFactory::new(config)?;
    let pool = Pool::new(PoolableConnectionFactory::validating(factory), PoolConfig::new());
    for (dn, password) in [
        ("uid=test,ou=People,dc=example,dc=org", "test"),
        ("uid=test,ou=People,dc=example,dc=org", "wrong"),
    ] {
        match pool.authenticate(dn, password) {
            Ok(None) => println!("{}: ok", dn),
            Ok(Some(PasswordWarning::TimeBeforeExpiration(secs))) => {
                println!("{}: ok, password expires in {}s", dn, secs)
            }
            Ok(Some(PasswordWarning::GraceLogins(n))) => {
                println!("{}: ok, {} grace logins left", dn, n)
            }
            Err(LdapError::PasswordRejected {
                result,
                policy_error,
            }) => println!("{}: rejected ({}), policy: {:?}", dn, result.rc, policy_error),
            Err(e) => return Err(e),
        }
    }
    pool.close();
    Ok(())
}
