//! In-process XMPP server for driving a full client session.
//!
//! Each test scripts the server side by hand: read what the client wrote,
//! answer with canned XML. The client's own [`Framer`] splits the byte
//! stream, so the server sees the same frames a real peer would.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jid::BareJid;
use minidom::Element;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use skua_xmpp::connector::framing::{Frame, Framer, StreamHeader};
use skua_xmpp::{ClientState, ConnectionConfiguration, Credentials, ServerEndpoint, SessionLogic};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DOMAIN: &str = "example.com";

pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Self-signed certificate for [`DOMAIN`].
pub struct TestTlsCredentials {
    cert: CertificateDer<'static>,
    key: Vec<u8>,
}

impl TestTlsCredentials {
    pub fn generate() -> Self {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![DOMAIN.to_string()])
                .expect("Failed to generate test certificate");
        Self {
            cert: cert.der().clone(),
            key: key_pair.serialize_der(),
        }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone()));
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], key)
            .expect("Failed to create server config");
        TlsAcceptor::from(Arc::new(config))
    }

    /// Client configuration trusting only this certificate.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).expect("Failed to add cert");
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub struct TestServer {
    listener: TcpListener,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        Self { listener }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("listener address")
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new("127.0.0.1", self.addr().port(), false)
    }

    pub async fn accept(&self) -> ServerConnection {
        let (socket, _) = timeout(DEFAULT_TIMEOUT, self.listener.accept())
            .await
            .expect("client connected in time")
            .expect("accept");
        ServerConnection {
            io: Box::new(socket),
            framer: Framer::new(),
        }
    }
}

/// The server side of one client connection.
pub struct ServerConnection {
    io: Box<dyn Io>,
    framer: Framer,
}

impl ServerConnection {
    /// Next frame from the client; `None` once the client hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.framer.next_frame().expect("client sent valid XML") {
                return Some(frame);
            }
            let n = timeout(DEFAULT_TIMEOUT, self.io.read(&mut buf))
                .await
                .expect("client wrote in time")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.framer.feed(&buf[..n]);
        }
    }

    pub async fn expect_header(&mut self) -> StreamHeader {
        match self.next_frame().await {
            Some(Frame::StreamOpen(header)) => header,
            other => panic!("expected stream header, got {other:?}"),
        }
    }

    pub async fn expect(&mut self) -> Element {
        match self.next_frame().await {
            Some(Frame::Element(element)) => element,
            other => panic!("expected element, got {other:?}"),
        }
    }

    /// Wait for the client to close its stream, then close ours.
    pub async fn expect_close(&mut self) {
        loop {
            match self.next_frame().await {
                Some(Frame::StreamClose) => break,
                None => return,
                Some(_) => continue,
            }
        }
        self.send("</stream:stream>").await;
    }

    pub async fn send(&mut self, xml: &str) {
        self.io
            .write_all(xml.as_bytes())
            .await
            .expect("write to client");
        self.io.flush().await.expect("flush");
    }

    /// Answer the client's stream header and announce `features`.
    pub async fn open_stream(&mut self, features: &str) -> StreamHeader {
        let header = self.expect_header().await;
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' id='{}' from='{DOMAIN}' version='1.0'>\
             <stream:features>{features}</stream:features>",
            uuid::Uuid::new_v4()
        ))
        .await;
        header
    }

    /// Handle `<starttls/>` and switch the connection to TLS.
    pub async fn starttls(&mut self, acceptor: &TlsAcceptor) {
        let request = self.expect().await;
        assert!(request.is("starttls", "urn:ietf:params:xml:ns:xmpp-tls"));
        self.send("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await;

        let plain = std::mem::replace(&mut self.io, Box::new(tokio::io::duplex(1).0));
        let tls = timeout(DEFAULT_TIMEOUT, acceptor.accept(plain))
            .await
            .expect("handshake in time")
            .expect("TLS handshake");
        self.io = Box::new(tls);
        self.framer = Framer::new();
    }

    /// Accept a PLAIN `<auth/>` for `user`/`pass`.
    pub async fn sasl_plain(&mut self) {
        let auth = self.expect().await;
        assert!(auth.is("auth", "urn:ietf:params:xml:ns:xmpp-sasl"));
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
    }

    /// Answer a resource bind request with `user@example.com/<resource>`.
    pub async fn bind(&mut self, resource: &str) {
        let request = self.expect().await;
        let bind = request
            .get_child("bind", "urn:ietf:params:xml:ns:xmpp-bind")
            .expect("bind request");
        let resource = bind
            .get_child("resource", "urn:ietf:params:xml:ns:xmpp-bind")
            .map(|r| r.text())
            .unwrap_or_else(|| resource.to_string());
        self.send(&format!(
            "<iq xmlns='jabber:client' type='result' id='{}'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@{DOMAIN}/{resource}</jid></bind></iq>",
            request.attr("id").expect("iq id")
        ))
        .await;
    }

    /// The usual legacy login: PLAIN, restart, bind.
    pub async fn login(&mut self) {
        self.open_stream(&mechanisms(&["PLAIN"])).await;
        self.sasl_plain().await;
        self.open_stream(BIND_FEATURES).await;
        self.bind("test").await;
    }
}

pub const BIND_FEATURES: &str = "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>";

pub fn mechanisms(names: &[&str]) -> String {
    let names: String = names
        .iter()
        .map(|name| format!("<mechanism>{name}</mechanism>"))
        .collect();
    format!("<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{names}</mechanisms>")
}

/// Configuration for `user@example.com` pointed at `endpoint`.
pub fn configuration(endpoint: ServerEndpoint) -> ConnectionConfiguration {
    let mut configuration = ConnectionConfiguration::new(
        BareJid::new(&format!("user@{DOMAIN}")).expect("valid jid"),
        Credentials::with_password("pass"),
    );
    configuration.connector.server = Some(endpoint);
    configuration
}

pub async fn wait_for_state(
    session: &SessionLogic,
    accept: impl Fn(&ClientState) -> bool,
) -> ClientState {
    let mut state = session.subscribe_state();
    let reached = timeout(DEFAULT_TIMEOUT, state.wait_for(|s| accept(s)))
        .await
        .expect("state reached in time")
        .expect("session alive");
    reached.clone()
}
