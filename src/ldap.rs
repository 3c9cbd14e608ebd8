use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::conn::{LdapConnAsync, LdapConnSettings, Transport};
use crate::controls::IntoRawControlVec;
use crate::cursor::SearchCursor;
use crate::exop::{construct_exop, Exop};
use crate::future::{ResponseFuture, SearchFuture};
use crate::protocol::{LdapOp, MaybeControls, Message, OpRequest, Response, ResultDelivery};
use crate::result::{ExopResult, LdapError, LdapResult, Result};
use crate::sasl::{Credentials, SaslMechanism};
use crate::search::{
    search_request, BinaryAttributeDetector, DefaultBinaryAttributeDetector, Scope, SearchOptions,
};
use crate::RequestId;

use ldap3::asn1::{Integer, Null, OctetString, Sequence, Tag, TagClass};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use url::Url;

/// Factory-assigned identity of a connection, stable across reconnects.
pub type ConnectionId = u64;

/// Default operation timeout of a new connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const SASL_BIND_IN_PROGRESS: u32 = 14;

/// Submission side of a connection driver.
///
/// Allocates message IDs and hands requests to the driver together with
/// the slot which will receive the response(s).
#[derive(Clone, Debug)]
pub(crate) struct OpSender {
    tx: mpsc::UnboundedSender<OpRequest>,
    msgmap: Arc<Mutex<(RequestId, HashSet<RequestId>)>>,
}

impl OpSender {
    #[cfg(test)]
    pub(crate) fn new(tx: mpsc::UnboundedSender<OpRequest>) -> OpSender {
        OpSender::with_msgmap(tx, Arc::new(Mutex::new((0, HashSet::new()))))
    }

    pub(crate) fn with_msgmap(
        tx: mpsc::UnboundedSender<OpRequest>,
        msgmap: Arc<Mutex<(RequestId, HashSet<RequestId>)>>,
    ) -> OpSender {
        OpSender { tx, msgmap }
    }

    /// Allocate a message ID which isn't used by any outstanding operation.
    pub(crate) fn next_msgid(&self) -> Result<RequestId> {
        let mut msgmap = self.msgmap.lock().expect("msgmap mutex (inc id)");
        let last_ldap_id = msgmap.0;
        let mut next_ldap_id = last_ldap_id;
        loop {
            if next_ldap_id == RequestId::MAX {
                next_ldap_id = 1;
            } else {
                next_ldap_id += 1;
            }
            if !msgmap.1.contains(&next_ldap_id) {
                break;
            }
            if next_ldap_id == last_ldap_id {
                return Err(LdapError::PoolInternalError(String::from(
                    "message id wraparound with no free slots",
                )));
            }
        }
        msgmap.0 = next_ldap_id;
        msgmap.1.insert(next_ldap_id);
        Ok(next_ldap_id)
    }

    pub(crate) fn release(&self, id: RequestId) {
        let mut msgmap = self.msgmap.lock().expect("msgmap mutex (release)");
        msgmap.1.remove(&id);
    }

    /// Queue a request for the driver. If the driver is gone, the ID is
    /// released and the slot inside `op` is dropped.
    pub(crate) fn send(
        &self,
        id: RequestId,
        op: LdapOp,
        tag: Tag,
        controls: MaybeControls,
    ) -> Result<()> {
        if self.tx.send((id, op, tag, controls)).is_err() {
            self.release(id);
            return Err(LdapError::ConnectionClosed);
        }
        Ok(())
    }

    /// Send an Abandon request for `msgid`. The driver fails the local slot
    /// of the operation with `OperationCancelled`.
    pub(crate) fn abandon(&self, msgid: RequestId) -> Result<()> {
        let id = self.next_msgid()?;
        let req = Tag::Integer(Integer {
            id: 16,
            class: TagClass::Application,
            inner: msgid as i64,
        });
        self.send(id, LdapOp::Abandon(msgid), req, None)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn sasl_bind_req(mech: &str, creds: Option<&[u8]>) -> Tag {
    let mut inner_vec = vec![Tag::OctetString(OctetString {
        inner: Vec::from(mech),
        ..Default::default()
    })];
    if let Some(creds) = creds {
        inner_vec.push(Tag::OctetString(OctetString {
            inner: creds.to_vec(),
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::new(),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Context,
                inner: inner_vec,
            }),
        ],
    })
}

fn unexpected(msg: Message, what: &str) -> LdapError {
    LdapError::Decoding(format!(
        "expected {} response to operation {}, got {:?}",
        what,
        msg.id,
        msg.kind()
    ))
}

fn bind_response(msg: Message) -> Result<(LdapResult, Option<Vec<u8>>)> {
    match msg.response {
        Response::Bind { result, sasl_creds } => Ok((result, sasl_creds)),
        _ => Err(unexpected(msg, "Bind")),
    }
}

fn extended_response(msg: Message) -> Result<ExopResult> {
    match msg.response {
        Response::Extended { result, exop } => Ok(ExopResult(exop, result)),
        _ => Err(unexpected(msg, "Extended")),
    }
}

/// Synchronous handle for one LDAP session.
///
/// The socket is owned by an I/O driver task running on the runtime supplied
/// at connection time, usually the one owned by a
/// [`ConnectionFactory`](trait.ConnectionFactory.html). Each operation
/// gets a fresh message ID, and its response is delivered through a
/// [`ResponseFuture`](struct.ResponseFuture.html) or, for searches, a
/// [`SearchFuture`](struct.SearchFuture.html). The blocking operations wait
/// on the future, bounded by the operation timeout.
///
/// As with the asynchronous ldap3 handle, a timeout, request controls and
/// search options can be attached to the next operation through
/// [`with_timeout()`](#method.with_timeout), [`with_controls()`](#method.with_controls)
/// and [`with_search_options()`](#method.with_search_options). Without an
/// explicit timeout, the connection default is used.
///
/// A connection is used by one caller at a time. Dropping a connection
/// which is still open sends an Unbind.
#[derive(Debug)]
pub struct LdapConnection {
    id: ConnectionId,
    url: Url,
    settings: LdapConnSettings,
    rt: Arc<Runtime>,
    sender: OpSender,
    connected: Arc<AtomicBool>,
    secured: bool,
    authenticated: bool,
    bound_as: Option<String>,
    bound_with: Option<Credentials>,
    default_timeout: Option<Duration>,
    detector: Arc<dyn BinaryAttributeDetector>,
    timeout: Option<Duration>,
    controls: MaybeControls,
    search_opts: Option<SearchOptions>,
    last_id: RequestId,
}

impl LdapConnection {
    /// Open a connection to `url`, spawning its driver on `rt`.
    ///
    /// Must not be called from within an asynchronous context.
    pub fn connect(
        id: ConnectionId,
        url: &str,
        settings: LdapConnSettings,
        rt: Arc<Runtime>,
    ) -> Result<LdapConnection> {
        let url = Url::parse(url)?;
        let (sender, connected, secured) = Self::start(&url, &settings, &rt)?;
        debug!("connection {} established to {}", id, url);
        Ok(LdapConnection {
            id,
            url,
            settings,
            rt,
            sender,
            connected,
            secured,
            authenticated: false,
            bound_as: None,
            bound_with: None,
            default_timeout: Some(DEFAULT_TIMEOUT),
            detector: Arc::new(DefaultBinaryAttributeDetector::default()),
            timeout: None,
            controls: None,
            search_opts: None,
            last_id: 0,
        })
    }

    fn start(
        url: &Url,
        settings: &LdapConnSettings,
        rt: &Runtime,
    ) -> Result<(OpSender, Arc<AtomicBool>, bool)> {
        let transport = rt.block_on(Transport::open(url, settings))?;
        let secured = transport.is_secured();
        let (conn, sender, connected) = LdapConnAsync::new(transport);
        rt.spawn(conn.drive());
        Ok((sender, connected, secured))
    }

    /// Use the provided timeout for the next operation instead of the
    /// connection default.
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.timeout = Some(duration);
        self
    }

    /// Pass the provided request control(s) to the next operation.
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.controls = Some(ctrls.into());
        self
    }

    /// Use the provided `SearchOptions` with the next Search operation. If the
    /// next operation isn't a Search, the options are silently discarded.
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.search_opts = Some(opts);
        self
    }

    fn op_timeout(&mut self) -> Option<Duration> {
        self.timeout.take().or(self.default_timeout)
    }

    fn submit<T, F>(&mut self, req: Tag, map: F) -> Result<ResponseFuture<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Message) -> Result<T> + Send + 'static,
    {
        let timeout = self.op_timeout();
        let controls = self.controls.take();
        self.search_opts = None;
        let id = self.sender.next_msgid()?;
        self.last_id = id;
        let (future, completer) = ResponseFuture::pair(id, timeout, Some(self.sender.clone()));
        let delivery: ResultDelivery = Box::new(move |outcome| {
            completer.complete(outcome.and_then(map));
        });
        self.sender.send(id, LdapOp::Single(delivery), req, controls)?;
        Ok(future)
    }

    fn record_bind(&mut self, result: &LdapResult, identity: Option<&str>) {
        if result.rc == 0 {
            self.authenticated = true;
            self.bound_as = identity.filter(|dn| !dn.is_empty()).map(String::from);
        } else if result.rc != SASL_BIND_IN_PROGRESS {
            self.authenticated = false;
            self.bound_as = None;
        }
    }

    /// Do a simple Bind with the provided DN (`bind_dn`) and password (`bind_pw`).
    ///
    /// The returned result must be checked by the caller; a non-zero result
    /// code leaves the connection unauthenticated.
    pub fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        self.bound_with = None;
        let req = Tag::Sequence(Sequence {
            id: 0,
            class: TagClass::Application,
            inner: vec![
                Tag::Integer(Integer {
                    inner: 3,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: Vec::from(bind_dn),
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    id: 0,
                    class: TagClass::Context,
                    inner: Vec::from(bind_pw),
                }),
            ],
        });
        let outcome = self.submit(req, bind_response).and_then(|f| f.get());
        match outcome {
            Ok((result, _)) => {
                self.record_bind(&result, Some(bind_dn));
                Ok(result)
            }
            Err(e) => {
                self.authenticated = false;
                self.bound_as = None;
                Err(e)
            }
        }
    }

    /// Do an SASL Bind with `mech`, repeating the exchange for as long as the
    /// server answers with saslBindInProgress.
    pub fn sasl_bind(&mut self, mech: &dyn SaslMechanism) -> Result<LdapResult> {
        self.bound_with = None;
        let controls = self.controls.take();
        let timeout = self.timeout.take();
        let mut creds = mech.initial_response()?;
        loop {
            if let Some(ref controls) = controls {
                self.controls = Some(controls.clone());
            }
            if let Some(timeout) = timeout {
                self.timeout = Some(timeout);
            }
            let req = sasl_bind_req(mech.name(), creds.as_deref());
            let (result, server_creds) = match self.submit(req, bind_response).and_then(|f| f.get()) {
                Ok(response) => response,
                Err(e) => {
                    self.authenticated = false;
                    self.bound_as = None;
                    return Err(e);
                }
            };
            self.record_bind(&result, None);
            if result.rc != SASL_BIND_IN_PROGRESS {
                return Ok(result);
            }
            debug!("SASL {} bind in progress on connection {}", mech.name(), self.id);
            creds = mech.step(server_creds.as_deref().unwrap_or(&[]))?;
        }
    }

    /// Bind with the given credentials. Returns the final result of the
    /// exchange, which must be checked by the caller.
    pub fn bind(&mut self, creds: &Credentials) -> Result<LdapResult> {
        let result = match creds {
            Credentials::Anonymous => self.simple_bind("", ""),
            Credentials::Simple { dn, password } => self.simple_bind(dn, password),
            Credentials::Sasl(mech) => self.sasl_bind(mech.as_ref()),
        }?;
        if result.rc == 0 {
            self.bound_with = Some(creds.clone());
        }
        Ok(result)
    }

    /// Start a Search and return a cursor over its responses.
    ///
    /// The `attrs` vector may be empty, meaning all user attributes.
    pub fn search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchCursor> {
        let future = self.search_future(base, scope, filter, attrs)?;
        Ok(SearchCursor::new(future, self.detector.clone()))
    }

    /// Start a Search and return the raw stream of its responses.
    pub fn search_future<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchFuture> {
        let timeout = self.op_timeout();
        let controls = self.controls.take();
        let opts = self.search_opts.take().unwrap_or_default();
        let req = search_request(base, scope, filter, attrs.as_ref(), &opts)?;
        let id = self.sender.next_msgid()?;
        self.last_id = id;
        let (future, sink) = SearchFuture::pair(id, timeout, Some(self.sender.clone()));
        self.sender.send(id, LdapOp::Search(sink), req, controls)?;
        Ok(future)
    }

    /// Perform an Extended operation and wait for its result.
    pub fn extended<E: Into<Exop>>(&mut self, exop: E) -> Result<ExopResult> {
        self.extended_future(exop)?.get()
    }

    /// Send an Extended operation, returning the future of its result.
    pub fn extended_future<E: Into<Exop>>(&mut self, exop: E) -> Result<ResponseFuture<ExopResult>> {
        let req = Tag::Sequence(Sequence {
            id: 23,
            class: TagClass::Application,
            inner: construct_exop(exop.into()),
        });
        self.submit(req, extended_response)
    }

    /// Ask the server to abandon the operation identified by `msgid`. The
    /// local future or cursor of the operation fails with `OperationCancelled`.
    pub fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        self.controls = None;
        self.sender.abandon(msgid)
    }

    /// Terminate the session. The driver sends the Unbind and shuts the
    /// transport down; outstanding operations fail with `ConnectionClosed`.
    pub fn unbind(&mut self) -> Result<()> {
        self.authenticated = false;
        self.bound_as = None;
        if !self.is_connected() {
            return Err(LdapError::ConnectionClosed);
        }
        let req = Tag::Null(Null {
            id: 2,
            class: TagClass::Application,
            inner: (),
        });
        let id = self.sender.next_msgid()?;
        let sent = self.sender.send(id, LdapOp::Unbind, req, self.controls.take());
        self.connected.store(false, Ordering::Release);
        sent
    }

    /// Unbind if still connected, swallowing any failure.
    pub fn close(&mut self) {
        if self.is_connected() {
            if let Err(e) = self.unbind() {
                debug!("unbind of connection {} failed: {}", self.id, e);
            }
        }
    }

    /// Re-establish the transport with the original URL and settings. The
    /// connection keeps its identity and configuration, but is no longer
    /// authenticated.
    pub fn reconnect(&mut self) -> Result<()> {
        self.close();
        let (sender, connected, secured) = Self::start(&self.url, &self.settings, &self.rt)?;
        self.sender = sender;
        self.connected = connected;
        self.secured = secured;
        self.authenticated = false;
        self.bound_as = None;
        self.last_id = 0;
        debug!("connection {} re-established to {}", self.id, self.url);
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// True while the I/O driver of the connection is alive.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// True if the last Bind on this transport succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated && self.is_connected()
    }

    /// True if the transport is protected by TLS.
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// DN of the last successful simple Bind, `None` for anonymous or
    /// SASL sessions.
    pub fn bound_identity(&self) -> Option<&str> {
        self.bound_as.as_deref()
    }

    /// True if the connection is authenticated, and its last Bind was done
    /// through [`bind()`](#method.bind) with `creds`.
    pub fn is_bound_with(&self, creds: &Credentials) -> bool {
        self.is_authenticated() && matches!(self.bound_with, Some(ref bound) if bound.same_as(creds))
    }

    /// Message ID of the last operation started on this connection.
    pub fn last_id(&self) -> RequestId {
        self.last_id
    }

    /// Default operation timeout; `None` means waiting indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.default_timeout = timeout;
    }

    pub fn binary_detector(&self) -> Arc<dyn BinaryAttributeDetector> {
        self.detector.clone()
    }

    pub fn set_binary_detector(&mut self, detector: Arc<dyn BinaryAttributeDetector>) {
        self.detector = detector;
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exop::{WhoAmI, WhoAmIResp};
    use crate::sasl::External;
    use crate::test_support::{
        bind_response, done, extended_response, intermediate, plain_result, search_entry,
        search_reference, test_runtime, MockServer,
    };

    use ldap3::asn1::parse_uint;

    fn connect(server: &MockServer) -> LdapConnection {
        LdapConnection::connect(1, &server.url(), LdapConnSettings::new(), test_runtime()).unwrap()
    }

    #[test]
    fn message_ids_skip_outstanding_and_wrap() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let msgmap = Arc::new(Mutex::new((RequestId::MAX - 1, HashSet::from([1]))));
        let sender = OpSender::with_msgmap(tx, msgmap);
        assert_eq!(sender.next_msgid().unwrap(), RequestId::MAX);
        assert_eq!(sender.next_msgid().unwrap(), 2);
        sender.release(1);
        sender.release(2);
        sender.release(RequestId::MAX);
        assert_eq!(sender.next_msgid().unwrap(), 3);
    }

    #[test]
    fn closed_driver_releases_the_id() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = OpSender::new(tx);
        let id = sender.next_msgid().unwrap();
        match sender.send(id, LdapOp::Unbind, Tag::Null(Null::default()), None) {
            Err(LdapError::ConnectionClosed) => (),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(sender.is_closed());
        assert!(!sender.msgmap.lock().unwrap().1.contains(&id));
    }

    #[test]
    fn simple_bind_sets_identity() {
        let server = MockServer::start(|req| match req.op_id() {
            0 => vec![bind_response(0, None)],
            _ => vec![],
        });
        let mut conn = connect(&server);
        assert!(conn.is_connected());
        assert!(!conn.is_authenticated());
        let res = conn.simple_bind("cn=admin,dc=example,dc=org", "secret").unwrap();
        assert_eq!(res.rc, 0);
        assert!(conn.is_authenticated());
        assert_eq!(conn.bound_identity(), Some("cn=admin,dc=example,dc=org"));
    }

    #[test]
    fn failed_bind_clears_identity() {
        let server = MockServer::start(|req| {
            let rc = if req.seen() == 0 { 0 } else { 49 };
            vec![bind_response(rc, None)]
        });
        let mut conn = connect(&server);
        conn.simple_bind("cn=admin,dc=example,dc=org", "secret").unwrap();
        let res = conn.simple_bind("cn=admin,dc=example,dc=org", "wrong").unwrap();
        assert_eq!(res.rc, 49);
        assert!(!conn.is_authenticated());
        assert_eq!(conn.bound_identity(), None);
    }

    #[derive(Debug)]
    struct Echo;

    impl SaslMechanism for Echo {
        fn name(&self) -> &str {
            "X-ECHO"
        }

        fn initial_response(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn step(&self, challenge: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(Some(challenge.to_vec()))
        }
    }

    #[test]
    fn sasl_exchange_runs_until_done() {
        let server = MockServer::start(|req| {
            let rc = if req.seen() == 0 { 14 } else { 0 };
            vec![bind_response(rc, Some(b"challenge".to_vec()))]
        });
        let mut conn = connect(&server);
        let res = conn.sasl_bind(&Echo).unwrap();
        assert_eq!(res.rc, 0);
        assert!(conn.is_authenticated());
        assert_eq!(conn.bound_identity(), None);
        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        let sasl = requests[1].components()[2].clone().expect_constructed().unwrap();
        assert_eq!(sasl[1].clone().expect_primitive().unwrap(), b"challenge".to_vec());
        let external = Credentials::Sasl(Arc::new(External));
        let res = conn.bind(&external).unwrap();
        assert_eq!(res.rc, 0);
        assert!(conn.is_bound_with(&external));
        conn.sasl_bind(&External).unwrap();
        assert!(!conn.is_bound_with(&external));
    }

    #[test]
    fn extended_operation_result() {
        let server =
            MockServer::start(|_| vec![extended_response(0, None, Some(b"dn:cn=admin".to_vec()))]);
        let mut conn = connect(&server);
        let (exop, _res) = conn.extended(WhoAmI).unwrap().success().unwrap();
        let whoami: WhoAmIResp = exop.parse().unwrap();
        assert_eq!(whoami.authzid, "dn:cn=admin");
    }

    #[test]
    fn unanswered_operation_times_out_and_is_abandoned() {
        let server = MockServer::start(|_| vec![]);
        let mut conn = connect(&server);
        let start = std::time::Instant::now();
        let err = conn
            .with_timeout(Duration::from_millis(100))
            .extended(WhoAmI)
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(100));
        let reqs = server.wait_for_requests(2);
        assert_eq!(reqs[1].op_id(), 16);
        assert!(conn.is_connected());
    }

    #[test]
    fn unbind_disconnects_and_fails_later_operations() {
        let server = MockServer::start(|_| vec![]);
        let mut conn = connect(&server);
        conn.unbind().unwrap();
        assert!(!conn.is_connected());
        let reqs = server.wait_for_requests(1);
        assert_eq!(reqs[0].op_id(), 2);
        assert!(conn.extended(WhoAmI).unwrap_err().is_retryable());
    }

    #[test]
    fn server_disconnect_fails_pending_operation() {
        let server = MockServer::start(|_| vec![]);
        let mut conn = connect(&server);
        let future = conn.extended_future(WhoAmI).unwrap();
        server.wait_for_requests(1);
        server.disconnect_all();
        match future.get_timeout(Duration::from_secs(5)) {
            Err(LdapError::ConnectionClosed) => (),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!conn.is_connected());
    }

    #[test]
    fn reconnect_restores_transport() {
        let server = MockServer::start(|_| vec![bind_response(0, None)]);
        let mut conn = connect(&server);
        conn.simple_bind("cn=a", "pw").unwrap();
        conn.unbind().unwrap();
        conn.reconnect().unwrap();
        assert!(conn.is_connected());
        assert!(!conn.is_authenticated());
        assert_eq!(conn.id(), 1);
        conn.simple_bind("cn=a", "pw").unwrap();
        assert!(conn.is_authenticated());
    }

    fn search_server(responses: fn() -> Vec<Tag>) -> MockServer {
        MockServer::start(move |req| match req.op_id() {
            3 => responses(),
            _ => vec![],
        })
    }

    #[test]
    fn search_entries_arrive_in_order() {
        let server = search_server(|| {
            vec![
                search_entry("cn=a,dc=example,dc=org", &[("cn", &[b"a"])]),
                search_entry("cn=b,dc=example,dc=org", &[("cn", &[b"b"])]),
                done(0, ""),
            ]
        });
        let mut conn = connect(&server);
        let mut cursor = conn
            .search("dc=example,dc=org", Scope::Subtree, "(cn=*)", vec!["cn"])
            .unwrap();
        let mut dns = vec![];
        while cursor.next().unwrap() {
            dns.push(cursor.get().unwrap().dn);
        }
        assert_eq!(dns, vec!["cn=a,dc=example,dc=org", "cn=b,dc=example,dc=org"]);
        assert_eq!(cursor.result().unwrap().rc, 0);
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, cursor.message_id());
    }

    #[test]
    fn search_reference_is_a_referral() {
        let server = search_server(|| {
            vec![
                search_reference(&["ldap://other.example.org/dc=example,dc=org"]),
                done(0, ""),
            ]
        });
        let mut conn = connect(&server);
        let mut cursor = conn
            .search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["1.1"])
            .unwrap();
        assert!(cursor.next().unwrap());
        match cursor.get() {
            Err(LdapError::Referral { urls }) => {
                assert_eq!(urls, vec!["ldap://other.example.org/dc=example,dc=org"])
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!cursor.next().unwrap());
        assert_eq!(cursor.result().unwrap().rc, 0);
    }

    #[test]
    fn search_intermediate_response_is_delivered() {
        let server = search_server(|| {
            vec![
                intermediate(Some("1.3.6.1.4.1.4203.1.9.1.4"), Some(vec![0x30, 0x00])),
                search_entry("cn=a,dc=example,dc=org", &[]),
                done(0, ""),
            ]
        });
        let mut conn = connect(&server);
        let mut cursor = conn
            .search("dc=example,dc=org", Scope::Subtree, "(cn=*)", vec!["cn"])
            .unwrap();
        assert!(cursor.next().unwrap());
        assert!(cursor.is_intermediate());
        let (name, value) = cursor.intermediate().unwrap();
        assert_eq!(name.as_deref(), Some("1.3.6.1.4.1.4203.1.9.1.4"));
        assert_eq!(value, Some(vec![0x30, 0x00]));
        let entries: Vec<_> = cursor.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].as_ref().unwrap().dn, "cn=a,dc=example,dc=org");
    }

    #[test]
    fn unexpected_response_breaks_search() {
        let server = search_server(|| vec![plain_result(1, 0)]);
        let mut conn = connect(&server);
        let mut cursor = conn
            .search("dc=example,dc=org", Scope::Base, "(objectClass=*)", vec!["1.1"])
            .unwrap();
        match cursor.next() {
            Err(LdapError::CursorBroken { source }) => {
                assert!(matches!(*source, LdapError::Decoding(_)))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn early_close_sends_abandon() {
        let server = search_server(|| vec![search_entry("cn=a,dc=example,dc=org", &[])]);
        let mut conn = connect(&server);
        let mut cursor = conn
            .search("dc=example,dc=org", Scope::Subtree, "(cn=*)", vec!["cn"])
            .unwrap();
        assert!(cursor.next().unwrap());
        cursor.close();
        let requests = server.wait_for_requests(2);
        assert_eq!(requests[1].op_id(), 16);
        let abandoned = requests[1].op.clone().expect_primitive().unwrap();
        let (_, id) = parse_uint(abandoned.as_slice()).unwrap();
        assert_eq!(id, cursor.message_id() as u64);
        assert!(conn.is_connected());
    }
}
