//! Loopback directory server and message builders for the unit tests.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::controls::RawControl;
use crate::protocol::{decode_envelope, encode_envelope};
use crate::RequestId;

use bytes::BytesMut;
use ldap3::asn1::{Enumerated, OctetString, Sequence, Set, StructureTag, Tag, TagClass};
use tokio::runtime::{Builder, Runtime};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn test_runtime() -> Arc<Runtime> {
    init_logging();
    Arc::new(
        Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("test runtime"),
    )
}

/// A request received by the mock server.
#[derive(Clone, Debug)]
pub(crate) struct Request {
    pub id: RequestId,
    pub op: StructureTag,
    pub controls: Vec<RawControl>,
    seen: usize,
}

impl Request {
    /// Application tag number of the protocol op.
    pub fn op_id(&self) -> u64 {
        self.op.id
    }

    /// Number of requests the server received before this one.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Components of the protocol op, if it's constructed.
    pub fn components(&self) -> Vec<StructureTag> {
        self.op.clone().expect_constructed().unwrap_or_default()
    }
}

/// Protocol op sent back by the mock server, with optional response controls.
pub(crate) type Reply = (Tag, Option<Vec<RawControl>>);

type Handler = Arc<dyn Fn(&Request) -> Vec<Reply> + Send + Sync>;

struct Shared {
    requests: Mutex<Vec<Request>>,
    arrived: Condvar,
    streams: Mutex<Vec<TcpStream>>,
    accepted: Mutex<usize>,
}

/// Scripted LDAP server on a loopback port.
///
/// Every request is recorded; the handler returns the protocol ops to send
/// back, each wrapped in an envelope with the request's message ID. Abandon
/// and Unbind requests are recorded, but never passed to the handler.
pub(crate) struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    pub fn start<F>(handler: F) -> MockServer
    where
        F: Fn(&Request) -> Vec<Tag> + Send + Sync + 'static,
    {
        MockServer::start_with_controls(move |req| {
            handler(req).into_iter().map(|tag| (tag, None)).collect()
        })
    }

    /// Like [`start()`](#method.start), but the handler can attach response
    /// controls to each op.
    pub fn start_with_controls<F>(handler: F) -> MockServer
    where
        F: Fn(&Request) -> Vec<Reply> + Send + Sync + 'static,
    {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let shared = Arc::new(Shared {
            requests: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
            streams: Mutex::new(Vec::new()),
            accepted: Mutex::new(0),
        });
        let handler: Handler = Arc::new(handler);
        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                if let Ok(clone) = stream.try_clone() {
                    accept_shared.streams.lock().unwrap().push(clone);
                }
                *accept_shared.accepted.lock().unwrap() += 1;
                let shared = accept_shared.clone();
                let handler = handler.clone();
                thread::spawn(move || serve(stream, shared, handler));
            }
        });
        MockServer { addr, shared }
    }

    pub fn url(&self) -> String {
        format!("ldap://127.0.0.1:{}", self.addr.port())
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        *self.shared.accepted.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Wait, for at most five seconds, until `n` requests have arrived.
    pub fn wait_for_requests(&self, n: usize) -> Vec<Request> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut requests = self.shared.requests.lock().unwrap();
        while requests.len() < n {
            let now = Instant::now();
            if now >= deadline {
                panic!("expected {} requests, got {}", n, requests.len());
            }
            requests = self
                .shared
                .arrived
                .wait_timeout(requests, deadline - now)
                .unwrap()
                .0;
        }
        requests.clone()
    }

    /// Close every accepted connection from the server side.
    pub fn disconnect_all(&self) {
        for stream in self.shared.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>, handler: Handler) {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        while let Ok(Some((id, op, controls))) = decode_envelope(&mut buf) {
            let request = {
                let mut requests = shared.requests.lock().unwrap();
                let request = Request {
                    id,
                    op,
                    controls,
                    seen: requests.len(),
                };
                requests.push(request.clone());
                shared.arrived.notify_all();
                request
            };
            if matches!(request.op_id(), 2 | 16) {
                continue;
            }
            for (tag, controls) in handler(&request) {
                if stream.write_all(&encode(id, tag, controls)).is_err() {
                    return;
                }
            }
        }
    }
}

pub(crate) fn encode(id: RequestId, tag: Tag, controls: Option<Vec<RawControl>>) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_envelope(id, tag, controls, &mut buf).expect("encode envelope");
    buf
}

fn octets(id: u64, bytes: &[u8]) -> Tag {
    Tag::OctetString(OctetString {
        id,
        class: TagClass::Context,
        inner: bytes.to_vec(),
    })
}

fn ldap_result(op: u64, rc: u32, text: &str, extra: Vec<Tag>) -> Tag {
    let mut inner = vec![
        Tag::Enumerated(Enumerated {
            inner: rc as i64,
            ..Default::default()
        }),
        Tag::OctetString(OctetString {
            inner: vec![],
            ..Default::default()
        }),
        Tag::OctetString(OctetString {
            inner: Vec::from(text),
            ..Default::default()
        }),
    ];
    inner.extend(extra);
    Tag::Sequence(Sequence {
        id: op,
        class: TagClass::Application,
        inner,
    })
}

/// Any response carrying just an LDAPResult, for protocol op `op`.
pub(crate) fn plain_result(op: u64, rc: u32) -> Tag {
    ldap_result(op, rc, "", vec![])
}

pub(crate) fn bind_response(rc: u32, sasl_creds: Option<Vec<u8>>) -> Tag {
    let extra = sasl_creds.map(|c| vec![octets(7, &c)]).unwrap_or_default();
    ldap_result(1, rc, "", extra)
}

pub(crate) fn done(rc: u32, text: &str) -> Tag {
    ldap_result(5, rc, text, vec![])
}

pub(crate) fn extended_response(rc: u32, name: Option<&str>, value: Option<Vec<u8>>) -> Tag {
    let mut extra = vec![];
    if let Some(name) = name {
        extra.push(octets(10, name.as_bytes()));
    }
    if let Some(value) = value {
        extra.push(octets(11, &value));
    }
    ldap_result(24, rc, "", extra)
}

pub(crate) fn search_entry(dn: &str, attrs: &[(&str, &[&[u8]])]) -> Tag {
    Tag::Sequence(Sequence {
        id: 4,
        class: TagClass::Application,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(dn),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|(name, values)| {
                        Tag::Sequence(Sequence {
                            inner: vec![
                                Tag::OctetString(OctetString {
                                    inner: Vec::from(*name),
                                    ..Default::default()
                                }),
                                Tag::Set(Set {
                                    inner: values
                                        .iter()
                                        .map(|v| {
                                            Tag::OctetString(OctetString {
                                                inner: v.to_vec(),
                                                ..Default::default()
                                            })
                                        })
                                        .collect(),
                                    ..Default::default()
                                }),
                            ],
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    })
}

pub(crate) fn search_reference(urls: &[&str]) -> Tag {
    Tag::Sequence(Sequence {
        id: 19,
        class: TagClass::Application,
        inner: urls
            .iter()
            .map(|u| {
                Tag::OctetString(OctetString {
                    inner: Vec::from(*u),
                    ..Default::default()
                })
            })
            .collect(),
    })
}

pub(crate) fn intermediate(name: Option<&str>, value: Option<Vec<u8>>) -> Tag {
    let mut inner = vec![];
    if let Some(name) = name {
        inner.push(octets(0, name.as_bytes()));
    }
    if let Some(value) = value {
        inner.push(octets(1, &value));
    }
    Tag::Sequence(Sequence {
        id: 25,
        class: TagClass::Application,
        inner,
    })
}
