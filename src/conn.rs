use std::collections::{HashMap, HashSet};
#[cfg(feature = "tls")]
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

#[cfg(feature = "tls")]
use crate::exop::{construct_exop, StartTls};
use crate::future::SearchSink;
use crate::ldap::OpSender;
use crate::protocol::{LdapCodec, LdapOp, Message, OpRequest, ResponseKind, ResultDelivery};
use crate::result::{LdapError, Result};
use crate::RequestId;

use futures_util::sink::SinkExt;
#[cfg(feature = "tls")]
use ldap3::asn1::{Sequence, Tag, TagClass};
#[cfg(feature = "tls")]
use native_tls::{Certificate, TlsConnector};
#[cfg(unix)]
use percent_encoding::percent_decode;
use serde::Deserialize;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time;
#[cfg(feature = "tls")]
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Framed};
use url::Url;

#[derive(Debug)]
enum ConnType {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(TlsStream<TcpStream>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for ConnType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_read(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnType {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_write(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_flush(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_flush(cx),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_shutdown(cx),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_shutdown(cx),
        }
    }
}

/// Transport settings for an LDAP connection.
///
/// An instance with default values is constructed by [`new()`](#method.new), and
/// the settings can be replaced through a builder-like interface. The structure
/// can also be deserialized from a configuration file; durations are given in
/// milliseconds.
///
/// TLS trust material is always explicit: CA certificates are added as PEM data
/// or file paths, and are read when a connection is made.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
#[cfg_attr(not(feature = "tls"), allow(dead_code))]
pub struct LdapConnSettings {
    #[serde(rename = "connect_timeout_ms", with = "crate::config::opt_millis")]
    conn_timeout: Option<Duration>,
    starttls: bool,
    no_tls_verify: bool,
    ca_cert_files: Vec<std::path::PathBuf>,
    #[serde(skip)]
    ca_certs_pem: Vec<Vec<u8>>,
}

impl LdapConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings {
            ..Default::default()
        }
    }

    /// Set the connection timeout, covering TCP establishment and any
    /// TLS negotiation. Defaults to `None`, meaning no timeout.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    pub fn conn_timeout(&self) -> Option<Duration> {
        self.conn_timeout
    }

    /// If `true`, use the StartTLS extended operation to secure an `ldap://`
    /// connection. Defaults to `false`. Without the __tls__ feature the
    /// setting is ignored.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    #[cfg(feature = "tls")]
    pub fn starttls(&self) -> bool {
        self.starttls
    }

    #[cfg(not(feature = "tls"))]
    /// Always `false` when no TLS support is compiled in.
    pub fn starttls(&self) -> bool {
        false
    }

    /// If `true`, try to establish a TLS connection without certificate
    /// verification. Defaults to `false`.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }

    /// Trust the CA certificate(s) in the PEM-encoded `pem`.
    pub fn add_ca_cert_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_certs_pem.push(pem);
        self
    }

    /// Trust the CA certificate in the PEM file at `path`.
    pub fn add_ca_cert_file<P: Into<std::path::PathBuf>>(mut self, path: P) -> Self {
        self.ca_cert_files.push(path.into());
        self
    }

    #[cfg(feature = "tls")]
    fn create_connector(&self) -> Result<TlsConnector> {
        let tls_err = |e: native_tls::Error| LdapError::Tls(e.to_string());
        let mut builder = TlsConnector::builder();
        let files: Vec<Vec<u8>> = self
            .ca_cert_files
            .iter()
            .map(|p: &PathBuf| std::fs::read(p))
            .collect::<io::Result<_>>()?;
        for pem in self.ca_certs_pem.iter().chain(files.iter()) {
            builder.add_root_certificate(Certificate::from_pem(pem).map_err(tls_err)?);
        }
        if self.no_tls_verify {
            builder.danger_accept_invalid_certs(true);
        }
        builder.build().map_err(tls_err)
    }
}

/// An established, framed transport, before the driver takes it over.
pub(crate) struct Transport {
    stream: Framed<ConnType, LdapCodec>,
    secured: bool,
    last_id: RequestId,
}

impl Transport {
    /// Connect to the server named by `url`, bounded by the connection timeout.
    pub(crate) async fn open(url: &Url, settings: &LdapConnSettings) -> Result<Transport> {
        match settings.conn_timeout {
            Some(timeout) => time::timeout(timeout, Self::open_inner(url, settings))
                .await
                .map_err(|_| LdapError::ConnectTimeout)?,
            None => Self::open_inner(url, settings).await,
        }
    }

    async fn open_inner(url: &Url, settings: &LdapConnSettings) -> Result<Transport> {
        if url.scheme() == "ldapi" {
            Self::open_unix(url).await
        } else {
            Self::open_tcp(url, settings).await
        }
    }

    #[cfg(unix)]
    async fn open_unix(url: &Url) -> Result<Transport> {
        let path = url.host_str().unwrap_or("");
        if path.is_empty() {
            return Err(LdapError::EmptyUnixPath);
        }
        if path.contains(':') || url.port().is_some() {
            return Err(LdapError::PortInUnixPath);
        }
        let dec_path = percent_decode(path.as_bytes()).decode_utf8_lossy();
        let stream = UnixStream::connect(dec_path.as_ref()).await?;
        Ok(Transport {
            stream: LdapCodec.framed(ConnType::Unix(stream)),
            secured: false,
            last_id: 0,
        })
    }

    #[cfg(not(unix))]
    async fn open_unix(_url: &Url) -> Result<Transport> {
        Err(LdapError::UnknownScheme(String::from("ldapi")))
    }

    #[allow(unused_mut)]
    async fn open_tcp(url: &Url, settings: &LdapConnSettings) -> Result<Transport> {
        let mut port = 389;
        let scheme = match url.scheme() {
            "ldap" if settings.starttls() => "starttls",
            s @ "ldap" => s,
            #[cfg(feature = "tls")]
            s @ "ldaps" => {
                port = 636;
                s
            }
            s => return Err(LdapError::UnknownScheme(String::from(s))),
        };
        if let Some(url_port) = url.port() {
            port = url_port;
        }
        let hostname = match url.host_str() {
            Some("") | None => "localhost",
            Some(h) => h,
        };
        let stream = TcpStream::connect((hostname, port)).await?;
        let mut transport = Transport {
            stream: LdapCodec.framed(ConnType::Tcp(stream)),
            secured: false,
            last_id: 0,
        };
        match scheme {
            "ldap" => (),
            #[cfg(feature = "tls")]
            s @ "ldaps" | s @ "starttls" => {
                if s == "starttls" {
                    transport.starttls().await?;
                }
                let connector = settings.create_connector()?;
                let parts = transport.stream.into_parts();
                let tls_stream = match parts.io {
                    ConnType::Tcp(stream) => TokioTlsConnector::from(connector)
                        .connect(hostname, stream)
                        .await
                        .map_err(|e| LdapError::Tls(e.to_string()))?,
                    _ => return Err(LdapError::UnknownScheme(String::from(s))),
                };
                transport.stream = parts.codec.framed(ConnType::Tls(tls_stream));
                transport.secured = true;
            }
            s => return Err(LdapError::UnknownScheme(String::from(s))),
        }
        Ok(transport)
    }

    // StartTLS runs before the driver exists, so the exchange is done directly
    // on the framed stream.
    #[cfg(feature = "tls")]
    async fn starttls(&mut self) -> Result<()> {
        let id = self.last_id + 1;
        self.last_id = id;
        let req = Tag::Sequence(Sequence {
            id: 23,
            class: TagClass::Application,
            inner: construct_exop(StartTls.into()),
        });
        self.stream.send((id, req, None)).await?;
        loop {
            let msg = match self.stream.next().await {
                Some(msg) => msg?,
                None => return Err(LdapError::ConnectionClosed),
            };
            if msg.id != id {
                debug!("ignoring message {} during StartTLS", msg.id);
                continue;
            }
            return match msg.response.result() {
                Some(res) => res.clone().success().map(|_| ()),
                None => Err(LdapError::Decoding(String::from("StartTLS response"))),
            };
        }
    }

    pub(crate) fn is_secured(&self) -> bool {
        self.secured
    }
}

/// The I/O driver of a connection.
///
/// The driver owns the socket. It writes requests submitted through the
/// [`OpSender`](../ldap/struct.OpSender.html) and routes every incoming message
/// to the slot registered for its message ID.
pub(crate) struct LdapConnAsync {
    msgmap: Arc<Mutex<(RequestId, HashSet<RequestId>)>>,
    resultmap: HashMap<RequestId, ResultDelivery>,
    searchmap: HashMap<RequestId, SearchSink>,
    rx: mpsc::UnboundedReceiver<OpRequest>,
    stream: Framed<ConnType, LdapCodec>,
    connected: Arc<AtomicBool>,
}

impl LdapConnAsync {
    pub(crate) fn new(transport: Transport) -> (LdapConnAsync, OpSender, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let msgmap = Arc::new(Mutex::new((transport.last_id, HashSet::new())));
        let connected = Arc::new(AtomicBool::new(true));
        let conn = LdapConnAsync {
            msgmap: msgmap.clone(),
            resultmap: HashMap::new(),
            searchmap: HashMap::new(),
            rx,
            stream: transport.stream,
            connected: connected.clone(),
        };
        (conn, OpSender::with_msgmap(tx, msgmap), connected)
    }

    /// Run the connection until it's unbound, closed by either side, or fails.
    /// Every operation still waiting for a response fails with `ConnectionClosed`.
    pub(crate) async fn drive(mut self) {
        if let Err(e) = self.turn().await {
            warn!("ldap connection error: {}", e);
        }
        self.connected.store(false, Ordering::Release);
        self.rx.close();
        while let Ok((_, op, _, _)) = self.rx.try_recv() {
            match op {
                LdapOp::Single(delivery) => delivery(Err(LdapError::ConnectionClosed)),
                LdapOp::Search(sink) => sink.fail(LdapError::ConnectionClosed),
                _ => (),
            }
        }
        for (_, delivery) in self.resultmap.drain() {
            delivery(Err(LdapError::ConnectionClosed));
        }
        for (_, sink) in self.searchmap.drain() {
            sink.fail(LdapError::ConnectionClosed);
        }
    }

    fn release_id(&self, id: RequestId) {
        let mut msgmap = self.msgmap.lock().expect("msgmap mutex (release)");
        msgmap.1.remove(&id);
    }

    async fn turn(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                op_tuple = self.rx.recv() => {
                    let (id, op, tag, controls) = match op_tuple {
                        Some(op_tuple) => op_tuple,
                        None => return Ok(()),
                    };
                    let unbind = matches!(op, LdapOp::Unbind);
                    match op {
                        LdapOp::Single(delivery) => {
                            self.resultmap.insert(id, delivery);
                        },
                        LdapOp::Search(sink) => {
                            self.searchmap.insert(id, sink);
                        },
                        LdapOp::Abandon(msgid) => {
                            if let Some(delivery) = self.resultmap.remove(&msgid) {
                                delivery(Err(LdapError::OperationCancelled { id: msgid }));
                            }
                            if let Some(sink) = self.searchmap.remove(&msgid) {
                                sink.fail(LdapError::OperationCancelled { id: msgid });
                            }
                            self.release_id(msgid);
                            self.release_id(id);
                        },
                        LdapOp::Unbind => (),
                    }
                    if let Err(e) = self.stream.send((id, tag, controls)).await {
                        warn!("socket send error: {}", e);
                        return Err(e);
                    }
                    if unbind {
                        if let Err(e) = self.stream.get_mut().shutdown().await {
                            debug!("socket shutdown error: {}", e);
                        }
                        return Ok(());
                    }
                },
                resp = self.stream.next() => {
                    let msg = match resp {
                        None => return Ok(()),
                        Some(Err(e)) => {
                            warn!("socket receive error: {}", e);
                            return Err(e);
                        },
                        Some(Ok(msg)) => msg,
                    };
                    if !self.dispatch(msg) {
                        return Ok(());
                    }
                },
            };
        }
    }

    // Returns false if the server has announced that it's closing the connection.
    fn dispatch(&mut self, msg: Message) -> bool {
        let id = msg.id;
        if id == 0 {
            if msg.is_notice_of_disconnection() {
                if let Some(res) = msg.response.result() {
                    warn!("notice of disconnection: {}", res);
                }
                return false;
            }
            debug!("ignoring unsolicited notification: {:?}", msg.response);
            return true;
        }
        if let Some(sink) = self.searchmap.get_mut(&id) {
            let done = msg.kind() == ResponseKind::Done;
            let accepted = sink.push(msg);
            if !accepted {
                debug!("search {} no longer consumed, dropping", id);
            }
            if done || !accepted {
                self.searchmap.remove(&id);
                self.release_id(id);
            }
        } else if let Some(delivery) = self.resultmap.remove(&id) {
            delivery(Ok(msg));
            self.release_id(id);
        } else {
            debug!("unmatched id: {}", id);
        }
        true
    }
}
