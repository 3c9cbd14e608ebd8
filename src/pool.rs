//! Bounded pool of reusable connections.
//!
//! The pool keeps a set of idle connections and the identities of the
//! borrowed ones. The number of borrowed connections never exceeds
//! `max_active`. Lifecycle hooks of a [`ManageConnection`](trait.ManageConnection.html)
//! implementation run around every borrow and release:
//!
//! * `make` creates a connection when no idle one is available;
//! * `activate` brings a connection into a usable state before it's handed out;
//! * `validate` checks it, when the pool is configured to test on borrow,
//!   on return or while idle;
//! * `passivate` resets it before it goes back to the idle set;
//! * `destroy` disposes of it, and never fails.
//!
//! A borrowed connection is wrapped in a [`PooledConnection`](struct.PooledConnection.html),
//! which releases it when dropped. Wrapping is idempotent, and unwrapping
//! always yields the raw connection, which can be released on its own. Every
//! connection which leaves the pool's accounting ends up idle, destroyed, or
//! in the hands of a caller.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::result::{LdapError, Result};

use serde::Deserialize;

/// Lifecycle hooks of the connections managed by a [`Pool`](struct.Pool.html).
///
/// The pool never invokes two hooks concurrently on the same connection.
pub trait ManageConnection: fmt::Debug + Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Create a new, ready-to-use connection.
    fn make(&self) -> Result<Self::Connection>;

    /// Prepare a connection for handing out.
    fn activate(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Check the health of a connection. Any failure means `false`.
    fn validate(&self, conn: &mut Self::Connection) -> bool;

    /// Reset a returned connection before it goes back to the idle set.
    /// On failure, the connection is destroyed.
    fn passivate(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Dispose of a connection. Failures must be handled by the implementation.
    fn destroy(&self, conn: Self::Connection);

    /// Identity of the connection, unique among the connections of the pool.
    fn id(&self, conn: &Self::Connection) -> u64;
}

/// Behavior of `borrow()` when `max_active` connections are out.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WhenExhausted {
    /// Wait for a release, for at most `max_wait`.
    #[default]
    Block,
    /// Fail immediately with `PoolExhausted`.
    Fail,
}

/// Pool configuration.
///
/// Like [`SearchOptions`](../struct.SearchOptions.html), the fields can be set
/// directly or through the builder methods of the same name. Deserialized
/// durations are given in milliseconds, with an `_ms` suffix on the key.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of borrowed connections.
    pub max_active: usize,
    /// Maximum number of idle connections; extra returned connections are destroyed.
    pub max_idle: usize,
    /// Number of idle connections the evictor tries to maintain.
    pub min_idle: usize,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,
    /// Interval of the background evictor; `None` disables it.
    #[serde(rename = "time_between_eviction_runs_ms", with = "crate::config::opt_millis")]
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle time after which the evictor destroys a connection; `None` keeps
    /// idle connections regardless of age.
    #[serde(rename = "min_evictable_idle_time_ms", with = "crate::config::opt_millis")]
    pub min_evictable_idle_time: Option<Duration>,
    /// Longest wait for a connection when exhausted; `None` waits indefinitely.
    #[serde(rename = "max_wait_ms", with = "crate::config::opt_millis")]
    pub max_wait: Option<Duration>,
    pub when_exhausted: WhenExhausted,
    /// Hand out the most recently returned idle connection first.
    pub lifo: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_active: 8,
            max_idle: 8,
            min_idle: 0,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
            max_wait: Some(Duration::from_secs(30)),
            when_exhausted: WhenExhausted::Block,
            lifo: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    pub fn test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }

    pub fn test_while_idle(mut self, test: bool) -> Self {
        self.test_while_idle = test;
        self
    }

    pub fn time_between_eviction_runs(mut self, interval: Option<Duration>) -> Self {
        self.time_between_eviction_runs = interval;
        self
    }

    pub fn min_evictable_idle_time(mut self, idle: Option<Duration>) -> Self {
        self.min_evictable_idle_time = idle;
        self
    }

    pub fn max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn when_exhausted(mut self, when_exhausted: WhenExhausted) -> Self {
        self.when_exhausted = when_exhausted;
        self
    }

    pub fn lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }
}

/// Snapshot of the pool accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub active: usize,
    /// Connections being created or activated for a borrower.
    pub pending: usize,
    pub closed: bool,
}

struct IdleConnection<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    active: HashSet<u64>,
    pending: usize,
    closed: bool,
}

struct Shutdown {
    stop: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    fn signal(&self) {
        *self.stop.lock().expect("shutdown mutex") = true;
        self.cond.notify_all();
    }
}

struct SharedPool<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    available: Condvar,
    shutdown: Arc<Shutdown>,
}

impl<M: ManageConnection> SharedPool<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().expect("pool mutex")
    }
}

impl<M: ManageConnection> Drop for SharedPool<M> {
    fn drop(&mut self) {
        self.shutdown.signal();
        let idle: Vec<_> = match self.state.get_mut() {
            Ok(state) => state.idle.drain(..).collect(),
            Err(_) => return,
        };
        for ic in idle {
            self.manager.destroy(ic.conn);
        }
    }
}

enum Candidate<C> {
    Idle(C),
    New,
}

/// Either a raw connection or one wrapped by a pool.
///
/// Accepted by [`Pool::wrap()`](struct.Pool.html#method.wrap) and
/// [`Pool::release()`](struct.Pool.html#method.release).
pub enum MaybePooled<M: ManageConnection> {
    Raw(M::Connection),
    Pooled(PooledConnection<M>),
}

impl<M: ManageConnection> From<PooledConnection<M>> for MaybePooled<M> {
    fn from(pc: PooledConnection<M>) -> Self {
        MaybePooled::Pooled(pc)
    }
}

/// Handle to a bounded connection pool. Clones share the pool.
pub struct Pool<M: ManageConnection> {
    shared: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            shared: self.shared.clone(),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool")
            .field("manager", &self.shared.manager)
            .field("status", &self.status())
            .finish()
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create a pool. If `time_between_eviction_runs` is set, a background
    /// thread runs [`evict()`](#method.evict) at that interval until the
    /// pool is closed or dropped.
    pub fn new(manager: M, config: PoolConfig) -> Pool<M> {
        let shutdown = Arc::new(Shutdown {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        });
        let interval = config.time_between_eviction_runs;
        let pool = Pool {
            shared: Arc::new(SharedPool {
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: HashSet::new(),
                    pending: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                shutdown: shutdown.clone(),
            }),
        };
        if let Some(interval) = interval {
            let weak = Arc::downgrade(&pool.shared);
            let spawned = thread::Builder::new()
                .name(String::from("ldap-pool-evictor"))
                .spawn(move || run_evictor(weak, shutdown, interval));
            if let Err(e) = spawned {
                warn!("unable to start the pool evictor: {}", e);
            }
        }
        pool
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow a connection.
    ///
    /// An idle connection is taken if there is one, otherwise a new one is
    /// created, as long as fewer than `max_active` connections are out. An idle
    /// connection which fails activation or validation is destroyed and the
    /// borrow is retried; a new connection failing either makes the borrow fail
    /// with `BorrowFailed`.
    pub fn borrow(&self) -> Result<PooledConnection<M>> {
        let deadline = self
            .shared
            .config
            .max_wait
            .and_then(|d| Instant::now().checked_add(d));
        loop {
            match self.reserve(deadline)? {
                Candidate::Idle(mut conn) => match self.prepare(&mut conn) {
                    Ok(()) => return Ok(self.checkout(conn)),
                    Err(e) => {
                        debug!("discarding idle connection: {}", e);
                        self.discard_reserved(conn);
                    }
                },
                Candidate::New => {
                    let mut conn = match self.shared.manager.make() {
                        Ok(conn) => conn,
                        Err(e) => {
                            self.cancel_reservation();
                            return Err(LdapError::BorrowFailed {
                                source: Box::new(e),
                            });
                        }
                    };
                    if let Err(e) = self.prepare(&mut conn) {
                        self.discard_reserved(conn);
                        return Err(LdapError::BorrowFailed {
                            source: Box::new(e),
                        });
                    }
                    return Ok(self.checkout(conn));
                }
            }
        }
    }

    fn reserve(&self, deadline: Option<Instant>) -> Result<Candidate<M::Connection>> {
        let config = &self.shared.config;
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(LdapError::PoolClosed);
            }
            if state.active.len() + state.pending < config.max_active {
                state.pending += 1;
                let idle = if config.lifo {
                    state.idle.pop_back()
                } else {
                    state.idle.pop_front()
                };
                return Ok(match idle {
                    Some(ic) => Candidate::Idle(ic.conn),
                    None => Candidate::New,
                });
            }
            if config.when_exhausted == WhenExhausted::Fail {
                return Err(LdapError::PoolExhausted);
            }
            state = match deadline {
                None => self.shared.available.wait(state).expect("pool mutex"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LdapError::PoolExhausted);
                    }
                    self.shared
                        .available
                        .wait_timeout(state, deadline - now)
                        .expect("pool mutex")
                        .0
                }
            };
        }
    }

    fn prepare(&self, conn: &mut M::Connection) -> Result<()> {
        self.shared.manager.activate(conn)?;
        if self.shared.config.test_on_borrow && !self.shared.manager.validate(conn) {
            return Err(LdapError::ValidationFailed);
        }
        Ok(())
    }

    fn checkout(&self, conn: M::Connection) -> PooledConnection<M> {
        let id = self.shared.manager.id(&conn);
        let mut state = self.shared.lock();
        state.pending -= 1;
        state.active.insert(id);
        drop(state);
        PooledConnection {
            pool: self.clone(),
            conn: Some(conn),
        }
    }

    fn cancel_reservation(&self) {
        let mut state = self.shared.lock();
        state.pending -= 1;
        drop(state);
        self.shared.available.notify_one();
    }

    fn discard_reserved(&self, conn: M::Connection) {
        self.shared.manager.destroy(conn);
        self.cancel_reservation();
    }

    /// Wrap a connection borrowed from this pool. A connection which is
    /// already wrapped is returned unchanged.
    ///
    /// Wrapping a raw connection the pool hasn't handed out is `PoolInternalError`,
    /// and the connection is destroyed.
    pub fn wrap(&self, conn: MaybePooled<M>) -> Result<PooledConnection<M>> {
        match conn {
            MaybePooled::Pooled(pc) => Ok(pc),
            MaybePooled::Raw(conn) => {
                let id = self.shared.manager.id(&conn);
                if !self.shared.lock().active.contains(&id) {
                    self.shared.manager.destroy(conn);
                    return Err(unknown_connection(id));
                }
                Ok(PooledConnection {
                    pool: self.clone(),
                    conn: Some(conn),
                })
            }
        }
    }

    /// Return a connection to the pool, unwrapping it first if necessary.
    ///
    /// The connection is passivated and, with `test_on_return`, validated.
    /// It then joins the idle set, unless it failed either step, the idle set
    /// is full, or the pool is closed, in which case it's destroyed. Releasing
    /// a connection the pool hasn't handed out is `PoolInternalError`, and the
    /// connection is destroyed.
    pub fn release(&self, conn: MaybePooled<M>) -> Result<()> {
        let raw = match conn {
            MaybePooled::Raw(conn) => conn,
            MaybePooled::Pooled(pc) => pc.into_inner(),
        };
        self.return_raw(raw)
    }

    fn return_raw(&self, mut conn: M::Connection) -> Result<()> {
        let manager = &self.shared.manager;
        let id = manager.id(&conn);
        if !self.shared.lock().active.contains(&id) {
            manager.destroy(conn);
            return Err(unknown_connection(id));
        }
        let keep = match manager.passivate(&mut conn) {
            Ok(()) => !self.shared.config.test_on_return || manager.validate(&mut conn),
            Err(e) => {
                debug!("passivation of connection {} failed: {}", id, e);
                false
            }
        };
        let mut state = self.shared.lock();
        state.active.remove(&id);
        let discard = if keep && !state.closed && state.idle.len() < self.shared.config.max_idle {
            state.idle.push_back(IdleConnection {
                conn,
                since: Instant::now(),
            });
            None
        } else {
            Some(conn)
        };
        drop(state);
        self.shared.available.notify_one();
        if let Some(conn) = discard {
            manager.destroy(conn);
        }
        Ok(())
    }

    fn forget(&self, id: u64) {
        let mut state = self.shared.lock();
        state.active.remove(&id);
        drop(state);
        self.shared.available.notify_one();
    }

    /// Run one eviction pass: destroy idle connections which have been idle
    /// for at least `min_evictable_idle_time`, validate the rest if
    /// `test_while_idle` is set, then create connections until `min_idle` are
    /// idle. Returns the number of destroyed connections.
    pub fn evict(&self) -> usize {
        let config = &self.shared.config;
        let manager = &self.shared.manager;
        let now = Instant::now();
        let (expired, mut kept): (Vec<_>, Vec<_>) = {
            let mut state = self.shared.lock();
            if state.closed {
                return 0;
            }
            state.idle.drain(..).partition(|ic| match config.min_evictable_idle_time {
                Some(min_idle_time) => now.duration_since(ic.since) >= min_idle_time,
                None => false,
            })
        };
        let mut destroyed = expired.len();
        for ic in expired {
            manager.destroy(ic.conn);
        }
        if config.test_while_idle {
            let (valid, invalid): (Vec<_>, Vec<_>) = kept
                .into_iter()
                .map(|mut ic| (manager.validate(&mut ic.conn), ic))
                .partition(|(valid, _)| *valid);
            destroyed += invalid.len();
            for (_, ic) in invalid {
                manager.destroy(ic.conn);
            }
            kept = valid.into_iter().map(|(_, ic)| ic).collect();
        }
        let missing = {
            let mut state = self.shared.lock();
            for ic in kept.into_iter().rev() {
                state.idle.push_front(ic);
            }
            config
                .min_idle
                .min(config.max_idle)
                .saturating_sub(state.idle.len())
        };
        if destroyed > 0 {
            debug!("evicted {} idle connections", destroyed);
        }
        for _ in 0..missing {
            let conn = match manager.make() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("unable to create idle connection: {}", e);
                    break;
                }
            };
            let mut state = self.shared.lock();
            if state.closed || state.idle.len() >= config.max_idle {
                drop(state);
                manager.destroy(conn);
                break;
            }
            state.idle.push_back(IdleConnection {
                conn,
                since: Instant::now(),
            });
            drop(state);
            self.shared.available.notify_one();
        }
        destroyed
    }

    /// Close the pool. Idle connections are destroyed, borrowed ones are
    /// destroyed when released, and every borrow fails with `PoolClosed`.
    pub fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.shared.available.notify_all();
        self.shared.shutdown.signal();
        debug!("pool closed, destroying {} idle connections", idle.len());
        for ic in idle {
            self.shared.manager.destroy(ic.conn);
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            idle: state.idle.len(),
            active: state.active.len(),
            pending: state.pending,
            closed: state.closed,
        }
    }

    pub fn num_idle(&self) -> usize {
        self.shared.lock().idle.len()
    }

    pub fn num_active(&self) -> usize {
        self.shared.lock().active.len()
    }
}

fn unknown_connection(id: u64) -> LdapError {
    LdapError::PoolInternalError(format!("connection {} was not borrowed from this pool", id))
}

fn run_evictor<M: ManageConnection>(pool: Weak<SharedPool<M>>, shutdown: Arc<Shutdown>, interval: Duration) {
    let mut stop = shutdown.stop.lock().expect("shutdown mutex");
    loop {
        let deadline = Instant::now().checked_add(interval);
        while !*stop {
            stop = match deadline {
                None => shutdown.cond.wait(stop).expect("shutdown mutex"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    shutdown
                        .cond
                        .wait_timeout(stop, deadline - now)
                        .expect("shutdown mutex")
                        .0
                }
            };
        }
        if *stop {
            return;
        }
        drop(stop);
        match pool.upgrade() {
            Some(shared) => {
                Pool { shared }.evict();
            }
            None => return,
        }
        stop = shutdown.stop.lock().expect("shutdown mutex");
    }
}

/// A connection borrowed from a [`Pool`](struct.Pool.html).
///
/// Dereferences to the raw connection, and releases it to the pool when
/// dropped.
pub struct PooledConnection<M: ManageConnection> {
    pool: Pool<M>,
    conn: Option<M::Connection>,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// The pool the connection was borrowed from.
    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    /// Unwrap the raw connection. It still counts as borrowed, and must be
    /// released with [`Pool::release()`](struct.Pool.html#method.release).
    pub fn into_inner(mut self) -> M::Connection {
        self.conn.take().expect("pooled connection present")
    }

    /// Remove the connection from the pool for good and take ownership of it.
    pub fn detach(mut self) -> M::Connection {
        let conn = self.conn.take().expect("pooled connection present");
        self.pool.forget(self.pool.shared.manager.id(&conn));
        conn
    }

    /// Release the connection now, reporting any failure.
    pub fn release(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self.pool.return_raw(conn),
            None => Ok(()),
        }
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.conn.as_ref().expect("pooled connection present")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.conn.as_mut().expect("pooled connection present")
    }
}

impl<M: ManageConnection> fmt::Debug for PooledConnection<M>
where
    M::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = self.pool.return_raw(conn) {
                warn!("connection release failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct TestConn {
        id: u64,
    }

    #[derive(Debug, Default)]
    struct TestManager {
        next_id: AtomicU64,
        fail_make: AtomicBool,
        invalid: AtomicBool,
        fail_passivate: AtomicBool,
        broken: Mutex<HashSet<u64>>,
        destroyed: Mutex<Vec<u64>>,
    }

    impl TestManager {
        fn destroyed(&self) -> Vec<u64> {
            self.destroyed.lock().unwrap().clone()
        }
    }

    impl ManageConnection for TestManager {
        type Connection = TestConn;

        fn make(&self) -> Result<TestConn> {
            if self.fail_make.load(Ordering::SeqCst) {
                return Err(LdapError::ConnectionClosed);
            }
            Ok(TestConn {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            })
        }

        fn activate(&self, conn: &mut TestConn) -> Result<()> {
            if self.broken.lock().unwrap().contains(&conn.id) {
                return Err(LdapError::ReactivationFailed {
                    source: Box::new(LdapError::ConnectionClosed),
                });
            }
            Ok(())
        }

        fn validate(&self, _conn: &mut TestConn) -> bool {
            !self.invalid.load(Ordering::SeqCst)
        }

        fn passivate(&self, _conn: &mut TestConn) -> Result<()> {
            if self.fail_passivate.load(Ordering::SeqCst) {
                return Err(LdapError::ConnectionClosed);
            }
            Ok(())
        }

        fn destroy(&self, conn: TestConn) {
            self.destroyed.lock().unwrap().push(conn.id);
        }

        fn id(&self, conn: &TestConn) -> u64 {
            conn.id
        }
    }

    fn pool(config: PoolConfig) -> Pool<TestManager> {
        Pool::new(TestManager::default(), config)
    }

    #[test]
    fn borrow_release_round_trip() {
        let pool = pool(PoolConfig::new());
        drop(pool.borrow().unwrap());
        assert_eq!(pool.num_idle(), 1);
        let conn = pool.borrow().unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 1);
        conn.release().unwrap();
        assert_eq!(
            pool.status(),
            PoolStatus {
                idle: 1,
                active: 0,
                pending: 0,
                closed: false
            }
        );
    }

    #[test]
    fn wrap_is_idempotent_and_unwrap_yields_raw() {
        let pool = pool(PoolConfig::new());
        let pc = pool.borrow().unwrap();
        let id = pc.id;
        let pc = pool.wrap(MaybePooled::Pooled(pc)).unwrap();
        let pc = pool.wrap(pc.into()).unwrap();
        assert_eq!(pc.id, id);
        let raw = pc.into_inner();
        assert_eq!(raw.id, id);
        assert_eq!(pool.num_active(), 1);
        let pc = pool.wrap(MaybePooled::Raw(raw)).unwrap();
        assert_eq!(pc.id, id);
        pool.release(pc.into()).unwrap();
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn releasing_unwrapped_connection_counts_once() {
        let pool = pool(PoolConfig::new());
        let raw = pool.borrow().unwrap().into_inner();
        pool.release(MaybePooled::Raw(raw)).unwrap();
        assert_eq!(pool.status().active, 0);
        assert_eq!(pool.status().idle, 1);
    }

    #[test]
    fn foreign_connection_is_internal_error() {
        let pool = pool(PoolConfig::new());
        match pool.release(MaybePooled::Raw(TestConn { id: 999 })) {
            Err(LdapError::PoolInternalError(_)) => (),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(
            pool.wrap(MaybePooled::Raw(TestConn { id: 998 })),
            Err(LdapError::PoolInternalError(_))
        ));
        assert_eq!(pool.manager().destroyed(), vec![999, 998]);
        assert_eq!(pool.num_idle(), 0);
    }

    #[test]
    fn exhausted_pool_fails_when_configured() {
        let pool = pool(PoolConfig::new().max_active(1).when_exhausted(WhenExhausted::Fail));
        let first = pool.borrow().unwrap();
        assert!(matches!(pool.borrow(), Err(LdapError::PoolExhausted)));
        drop(first);
        assert!(pool.borrow().is_ok());
    }

    #[test]
    fn exhausted_pool_blocks_until_release() {
        let pool = pool(
            PoolConfig::new()
                .max_active(1)
                .max_wait(Some(Duration::from_secs(5))),
        );
        let first = pool.borrow().unwrap();
        let id = first.id;
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(first);
        });
        let start = Instant::now();
        let second = pool.borrow().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(second.id, id);
        releaser.join().unwrap();
    }

    #[test]
    fn blocked_borrow_is_bounded_by_max_wait() {
        let pool = pool(
            PoolConfig::new()
                .max_active(1)
                .max_wait(Some(Duration::from_millis(50))),
        );
        let _first = pool.borrow().unwrap();
        let start = Instant::now();
        assert!(matches!(pool.borrow(), Err(LdapError::PoolExhausted)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn unbounded_max_wait_blocks_until_release() {
        let pool = pool(
            PoolConfig::new()
                .max_active(1)
                .max_wait(Some(Duration::MAX))
                .time_between_eviction_runs(Some(Duration::MAX)),
        );
        let first = pool.borrow().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(first);
        });
        assert_eq!(pool.borrow().unwrap().id, 1);
        releaser.join().unwrap();
        pool.close();
    }

    #[test]
    fn outstanding_borrows_never_exceed_max_active() {
        let pool = pool(PoolConfig::new().max_active(3).max_idle(3));
        let out = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let out = out.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let conn = pool.borrow().unwrap();
                        let now = out.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        out.fetch_sub(1, Ordering::SeqCst);
                        drop(conn);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.num_active(), 0);
        assert!(pool.num_idle() <= 3);
    }

    #[test]
    fn broken_idle_connection_is_replaced() {
        let pool = pool(PoolConfig::new());
        drop(pool.borrow().unwrap());
        pool.manager().broken.lock().unwrap().insert(1);
        let conn = pool.borrow().unwrap();
        assert_eq!(conn.id, 2);
        assert_eq!(pool.manager().destroyed(), vec![1]);
        assert_eq!(pool.status().pending, 0);
    }

    #[test]
    fn invalid_new_connection_fails_borrow() {
        let pool = pool(PoolConfig::new().test_on_borrow(true));
        pool.manager().invalid.store(true, Ordering::SeqCst);
        match pool.borrow() {
            Err(LdapError::BorrowFailed { source }) => {
                assert!(matches!(*source, LdapError::ValidationFailed))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(pool.manager().destroyed(), vec![1]);
        assert_eq!(pool.status().active + pool.status().pending, 0);
    }

    #[test]
    fn failed_creation_fails_borrow() {
        let pool = pool(PoolConfig::new().max_active(1));
        pool.manager().fail_make.store(true, Ordering::SeqCst);
        let err = pool.borrow().unwrap_err();
        assert!(matches!(err, LdapError::BorrowFailed { .. }));
        assert!(err.is_retryable());
        pool.manager().fail_make.store(false, Ordering::SeqCst);
        assert!(pool.borrow().is_ok());
    }

    #[test]
    fn invalid_or_unpassivated_return_is_destroyed() {
        let pool = pool(PoolConfig::new().test_on_return(true));
        let conn = pool.borrow().unwrap();
        pool.manager().invalid.store(true, Ordering::SeqCst);
        drop(conn);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.manager().destroyed(), vec![1]);
        pool.manager().invalid.store(false, Ordering::SeqCst);
        pool.manager().fail_passivate.store(true, Ordering::SeqCst);
        drop(pool.borrow().unwrap());
        assert_eq!(pool.manager().destroyed(), vec![1, 2]);
        assert_eq!(pool.num_active(), 0);
    }

    #[test]
    fn surplus_idle_connections_are_destroyed() {
        let pool = pool(PoolConfig::new().max_idle(1));
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.manager().destroyed(), vec![2]);
    }

    #[test]
    fn lifo_and_fifo_order() {
        for (lifo, expected) in [(true, 2), (false, 1)] {
            let pool = pool(PoolConfig::new().lifo(lifo));
            let a = pool.borrow().unwrap();
            let b = pool.borrow().unwrap();
            drop(a);
            drop(b);
            assert_eq!(pool.borrow().unwrap().id, expected);
        }
    }

    #[test]
    fn eviction_destroys_old_and_tops_up() {
        let pool = pool(
            PoolConfig::new()
                .min_idle(2)
                .min_evictable_idle_time(Some(Duration::ZERO)),
        );
        drop(pool.borrow().unwrap());
        assert_eq!(pool.evict(), 1);
        assert_eq!(pool.manager().destroyed(), vec![1]);
        assert_eq!(pool.num_idle(), 2);
    }

    #[test]
    fn idle_validation_during_eviction() {
        let pool = pool(
            PoolConfig::new()
                .test_while_idle(true)
                .min_evictable_idle_time(None),
        );
        drop(pool.borrow().unwrap());
        assert_eq!(pool.evict(), 0);
        assert_eq!(pool.num_idle(), 1);
        pool.manager().invalid.store(true, Ordering::SeqCst);
        assert_eq!(pool.evict(), 1);
        assert_eq!(pool.num_idle(), 0);
    }

    #[test]
    fn background_evictor_runs() {
        let pool = pool(
            PoolConfig::new()
                .time_between_eviction_runs(Some(Duration::from_millis(10)))
                .min_evictable_idle_time(Some(Duration::ZERO)),
        );
        drop(pool.borrow().unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.num_idle() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.manager().destroyed(), vec![1]);
        pool.close();
    }

    #[test]
    fn closed_pool_refuses_borrows_and_destroys_returns() {
        let pool = pool(PoolConfig::new());
        let held = pool.borrow().unwrap();
        drop(pool.borrow().unwrap());
        pool.close();
        assert_eq!(pool.manager().destroyed(), vec![2]);
        assert!(matches!(pool.borrow(), Err(LdapError::PoolClosed)));
        drop(held);
        assert_eq!(pool.manager().destroyed(), vec![2, 1]);
        assert!(pool.status().closed);
    }

    #[test]
    fn close_wakes_blocked_borrower() {
        let pool = pool(PoolConfig::new().max_active(1).max_wait(None));
        let _held = pool.borrow().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(30));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(LdapError::PoolClosed)));
    }

    #[test]
    fn detached_connection_leaves_accounting() {
        let pool = pool(PoolConfig::new().max_active(1).when_exhausted(WhenExhausted::Fail));
        let raw = pool.borrow().unwrap().detach();
        assert_eq!(raw.id, 1);
        assert_eq!(pool.num_active(), 0);
        assert!(pool.borrow().is_ok());
        assert!(pool.manager().destroyed().is_empty());
    }

    #[test]
    fn config_from_toml() {
        let config: PoolConfig = toml::from_str(
            r#"
            max_active = 4
            test_on_borrow = true
            max_wait_ms = 250
            when_exhausted = "fail"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_active, 4);
        assert_eq!(config.max_idle, 8);
        assert!(config.test_on_borrow);
        assert_eq!(config.max_wait, Some(Duration::from_millis(250)));
        assert_eq!(config.when_exhausted, WhenExhausted::Fail);
        assert!(config.lifo);
    }
}
