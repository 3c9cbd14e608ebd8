// Demonstrates borrowing connections from a pool in several threads,
// each running a Search and reading the results with a cursor.
//
// The cursor abandons the Search if it's closed before the end
// of the result stream, as the second thread does.

use std::thread;

use ldap3_pool::pool::{Pool, PoolConfig};
use ldap3_pool::result::Result;
use ldap3_pool::{
    Credentials, DefaultConnectionFactory, LdapConnectionConfig, PoolableConnectionFactory, Scope,
};

fn main() -> Result<()> {
    env_logger::init();
    let config = LdapConnectionConfig::new("ldap://localhost:2389")
        .with_credentials(Credentials::simple("cn=Manager,dc=example,dc=org", "secret"));
    let factory = DefaultConnectionFactory::new(config)?;
    let pool = Pool::new(
        PoolableConnectionFactory::new(factory),
        PoolConfig::new().max_active(2).test_on_borrow(true),
    );
    let workers: Vec<_> = (0..4)
        .map(|n| {
            let pool = pool.clone();
            thread::spawn(move || -> Result<()> {
                let mut conn = pool.borrow()?;
                let mut cursor = conn.search(
                    "ou=Places,dc=example,dc=org",
                    Scope::Subtree,
                    "(objectClass=locality)",
                    vec!["l"],
                )?;
                while cursor.next()? {
                    if cursor.is_entry() {
                        println!("[{}] {:?}", n, cursor.get()?);
                    }
                    if n == 1 {
                        cursor.close();
                        break;
                    }
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        if let Ok(Err(e)) = worker.join() {
            eprintln!("search failed: {}", e);
        }
    }
    println!("{:?}", pool.status());
    pool.close();
    Ok(())
}
