//! Socket ownership and stream framing.
//!
//! A [`Connector`] is a cheap handle onto a single actor task that owns the
//! socket, the TLS and zlib layers and the [`Framer`]. Every mutation goes
//! through the actor's command channel, so writes never interleave and a
//! reconnect can't race with an in-flight send. The actor reports what it
//! sees as an ordered stream of [`ConnectorEvent`]s.

pub mod dns;
pub mod framing;
pub mod transport;

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use minidom::Element;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectorOptions;
use crate::error::{ConnectionError, XmppError};
use crate::ns;
use crate::stanza::Stanza;

use self::dns::{NEGATIVE_CACHE_TTL, ServerEndpoint, ServerResolver, SrvResolver, select_endpoint};
use self::framing::{Frame, Framer, StreamHeader};
use self::transport::{ChannelBindingType, ChannelBindings, Socket, ZlibCodec};

const READ_BUFFER_SIZE: usize = 8192;
const STREAM_CLOSE: &[u8] = b"</stream:stream>";

#[derive(Debug, Clone)]
pub enum DisconnectReason {
    None,
    Timeout,
    TlsCertError,
    XmlError,
    StreamError(Element),
    NoRouteToServer,
}

#[derive(Debug, Clone)]
pub enum ConnectorState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected(DisconnectReason),
}

impl ConnectorState {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectorState::Disconnected(_))
    }
}

/// States compare by kind; the disconnect reason is ignored.
impl PartialEq for ConnectorState {
    fn eq(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl Eq for ConnectorState {}

/// Features the connector itself activates on request of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFeature {
    Tls,
    Zlib,
}

#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    State(ConnectorState),
    /// The transport is ready for a (new) client stream header.
    StreamStart,
    StreamOpened(StreamHeader),
    Stanza(Stanza),
    /// The server closed its half of the stream.
    StreamClose,
    /// The stream is gone without a local `stop`.
    StreamTerminate,
}

enum Command {
    Start {
        domain: String,
        endpoint: Option<ServerEndpoint>,
    },
    Stop {
        force: bool,
        done: oneshot::Sender<()>,
    },
    Send {
        data: Vec<u8>,
        done: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    },
    Activate(StreamFeature),
    Restart,
}

#[derive(Clone)]
pub struct Connector {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectorState>,
    bindings: watch::Receiver<ChannelBindings>,
    flags: Arc<Flags>,
    endpoint: Arc<Mutex<Option<ServerEndpoint>>>,
}

#[derive(Default)]
struct Flags {
    tls: AtomicBool,
    compression: AtomicBool,
}

impl Connector {
    /// Spawn the connector actor. It lives until every handle is dropped.
    pub fn new(options: ConnectorOptions) -> (Self, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) =
            watch::channel(ConnectorState::Disconnected(DisconnectReason::None));
        let (bindings_tx, bindings_rx) = watch::channel(ChannelBindings::default());
        let flags = Arc::new(Flags::default());
        let endpoint = Arc::new(Mutex::new(None));

        let resolver: Arc<dyn ServerResolver> = match &options.resolver {
            Some(resolver) => resolver.clone(),
            None => Arc::new(SrvResolver::new()),
        };

        let actor = Actor {
            options,
            resolver,
            events: events_tx,
            state: state_tx,
            bindings: bindings_tx,
            flags: flags.clone(),
            endpoint: endpoint.clone(),
            framer: Framer::new(),
            zlib: None,
            domain: String::new(),
        };
        tokio::spawn(actor.run(commands_rx));

        let connector = Self {
            commands: commands_tx,
            state: state_rx,
            bindings: bindings_rx,
            flags,
            endpoint,
        };
        (connector, events_rx)
    }

    /// Connect to `endpoint`, or to whatever DNS yields for `domain`.
    pub fn start(&self, domain: &str, endpoint: Option<ServerEndpoint>) {
        let _ = self.commands.send(Command::Start {
            domain: domain.to_string(),
            endpoint,
        });
    }

    /// Close the connection. Returns once the connector is disconnected;
    /// a no-op when it already is.
    pub async fn stop(&self, force: bool) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Stop { force, done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Write raw bytes and wait until they were flushed to the socket.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        self.enqueue(data).await.map_err(|_| not_connected())?
    }

    /// Queue raw bytes right away; the receiver resolves once they were
    /// flushed. Queued writes keep the order of the calls.
    pub fn enqueue(&self, data: Vec<u8>) -> oneshot::Receiver<Result<(), ConnectionError>> {
        let (done, wait) = oneshot::channel();
        // a dead actor drops `done`, which the receiver reports as closed
        let _ = self.commands.send(Command::Send {
            data,
            done: Some(done),
        });
        wait
    }

    /// Queue raw bytes behind everything already queued, without waiting.
    pub fn send_nowait(&self, data: Vec<u8>) {
        let _ = self.commands.send(Command::Send { data, done: None });
    }

    pub fn activate(&self, feature: StreamFeature) {
        let _ = self.commands.send(Command::Activate(feature));
    }

    /// Discard the inbound parser state and ask for a new stream header,
    /// as required after a successful SASL exchange.
    pub fn restart_stream(&self) {
        let _ = self.commands.send(Command::Restart);
    }

    pub fn state(&self) -> ConnectorState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectorState> {
        self.state.clone()
    }

    pub fn is_tls_active(&self) -> bool {
        self.flags.tls.load(Ordering::Acquire)
    }

    pub fn is_compression_active(&self) -> bool {
        self.flags.compression.load(Ordering::Acquire)
    }

    pub fn channel_binding(&self, kind: ChannelBindingType) -> Result<Vec<u8>, XmppError> {
        self.bindings.borrow().get(kind)
    }

    pub fn channel_bindings(&self) -> ChannelBindings {
        self.bindings.borrow().clone()
    }

    pub fn current_endpoint(&self) -> Option<ServerEndpoint> {
        self.endpoint.lock().ok().and_then(|endpoint| endpoint.clone())
    }

    /// Turn a redirect or resumption location into an endpoint, inheriting
    /// port and TLS mode from the current connection.
    pub fn prepare_endpoint(&self, location: &str) -> Option<ServerEndpoint> {
        ServerEndpoint::from_location(location, self.current_endpoint().as_ref())
    }
}

fn not_connected() -> ConnectionError {
    ConnectionError::TransportError(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "connector is not connected",
    ))
}

enum Flow {
    Continue,
    Closed,
}

struct Actor {
    options: ConnectorOptions,
    resolver: Arc<dyn ServerResolver>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    state: watch::Sender<ConnectorState>,
    bindings: watch::Sender<ChannelBindings>,
    flags: Arc<Flags>,
    endpoint: Arc<Mutex<Option<ServerEndpoint>>>,
    framer: Framer,
    zlib: Option<ZlibCodec>,
    domain: String,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Start { domain, endpoint } => {
                    self.domain = domain;
                    if let Some(socket) = self.connect(endpoint, &mut commands).await {
                        self.serve(socket, &mut commands).await;
                    }
                }
                Command::Stop { done, .. } => {
                    let _ = done.send(());
                }
                Command::Send { done, .. } => {
                    if let Some(done) = done {
                        let _ = done.send(Err(not_connected()));
                    }
                }
                Command::Activate(feature) => {
                    debug!(?feature, "Ignoring activation while disconnected");
                }
                Command::Restart => debug!("Ignoring stream restart while disconnected"),
            }
        }
        debug!("Connector handles dropped, actor exiting");
    }

    fn set_state(&self, state: ConnectorState) {
        debug!(?state, "Connector state changed");
        self.state.send_replace(state.clone());
        self.emit(ConnectorEvent::State(state));
    }

    fn emit(&self, event: ConnectorEvent) {
        let _ = self.events.send(event);
    }

    /// Runs the connect phase while still answering commands.
    async fn connect(
        &mut self,
        endpoint: Option<ServerEndpoint>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<Socket> {
        self.set_state(ConnectorState::Connecting);

        let establish = establish(
            self.options.clone(),
            self.resolver.clone(),
            self.domain.clone(),
            endpoint,
        );
        tokio::pin!(establish);

        let result = loop {
            tokio::select! {
                result = &mut establish => break result,
                command = commands.recv() => match command {
                    None => return None,
                    Some(Command::Stop { done, .. }) => {
                        self.set_state(ConnectorState::Disconnected(DisconnectReason::Timeout));
                        let _ = done.send(());
                        return None;
                    }
                    Some(Command::Send { done, .. }) => {
                        if let Some(done) = done {
                            let _ = done.send(Err(not_connected()));
                        }
                    }
                    Some(Command::Start { .. }) => debug!("Already connecting"),
                    Some(Command::Activate(feature)) => {
                        debug!(?feature, "Ignoring activation while connecting");
                    }
                    Some(Command::Restart) => debug!("Ignoring stream restart while connecting"),
                },
            }
        };

        match result {
            Ok((socket, endpoint)) => {
                info!(%endpoint, tls = socket.is_tls(), "Connected");
                if let Ok(mut current) = self.endpoint.lock() {
                    *current = Some(endpoint);
                }
                self.flags.tls.store(socket.is_tls(), Ordering::Release);
                self.bindings.send_replace(socket.channel_bindings());
                self.framer.reset();
                self.zlib = None;
                self.set_state(ConnectorState::Connected);
                self.emit(ConnectorEvent::StreamStart);
                Some(socket)
            }
            Err(failure) => {
                warn!(endpoint = ?failure.endpoint, error = %failure.error, "Connection failed");
                if let Some(endpoint) = &failure.endpoint {
                    if matches!(
                        failure.reason,
                        DisconnectReason::Timeout | DisconnectReason::NoRouteToServer
                    ) {
                        self.resolver.mark_invalid(endpoint, NEGATIVE_CACHE_TTL);
                    }
                }
                self.set_state(ConnectorState::Disconnected(failure.reason));
                None
            }
        }
    }

    async fn serve(&mut self, mut socket: Socket, commands: &mut mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => {
                        socket.shutdown().await;
                        return;
                    }
                    Some(Command::Start { .. }) => debug!("Already connected"),
                    Some(Command::Stop { force, done }) => {
                        self.close(&mut socket, force).await;
                        let _ = done.send(());
                        return;
                    }
                    Some(Command::Send { data, done }) => {
                        let result = self.write(&mut socket, &data).await;
                        let failed = result.is_err();
                        match done {
                            Some(done) => {
                                let _ = done.send(result);
                            }
                            None => {
                                if let Err(e) = result {
                                    warn!(error = %e, "Queued write failed");
                                }
                            }
                        }
                        if failed {
                            self.terminate(&mut socket, DisconnectReason::None).await;
                            return;
                        }
                    }
                    Some(Command::Activate(feature)) => {
                        if let Err(e) = self.activate(&mut socket, feature).await {
                            warn!(error = %e, ?feature, "Failed to request feature");
                            self.terminate(&mut socket, DisconnectReason::None).await;
                            return;
                        }
                    }
                    Some(Command::Restart) => self.restart_stream(),
                },
                read = socket.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Server closed the connection");
                        self.terminate(&mut socket, DisconnectReason::None).await;
                        return;
                    }
                    Ok(n) => {
                        if let Flow::Closed = self.receive(&mut socket, &buf[..n]).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Read failed");
                        self.terminate(&mut socket, DisconnectReason::None).await;
                        return;
                    }
                },
            }
        }
    }

    async fn write(&mut self, socket: &mut Socket, data: &[u8]) -> Result<(), ConnectionError> {
        trace!(data = %String::from_utf8_lossy(data), "Sending");
        match &mut self.zlib {
            Some(codec) => {
                let compressed = codec.compress(data)?;
                socket.write_all(&compressed).await?;
            }
            None => socket.write_all(data).await?,
        }
        Ok(())
    }

    async fn activate(
        &mut self,
        socket: &mut Socket,
        feature: StreamFeature,
    ) -> Result<(), ConnectionError> {
        let element = match feature {
            StreamFeature::Tls => Element::builder("starttls", ns::TLS).build(),
            StreamFeature::Zlib => Element::builder("compress", ns::COMPRESS)
                .append(Element::builder("method", ns::COMPRESS).append("zlib").build())
                .build(),
        };
        let data = Stanza::new(element).to_bytes()?;
        self.write(socket, &data).await
    }

    async fn receive(&mut self, socket: &mut Socket, data: &[u8]) -> Flow {
        let plain = match &mut self.zlib {
            Some(codec) => match codec.decompress(data) {
                Ok(plain) => plain,
                Err(e) => {
                    warn!(error = %e, "Failed to decompress input");
                    self.terminate(socket, DisconnectReason::XmlError).await;
                    return Flow::Closed;
                }
            },
            None => data.to_vec(),
        };
        trace!(data = %String::from_utf8_lossy(&plain), "Received");
        self.framer.feed(&plain);

        loop {
            let frame = match self.framer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Flow::Continue,
                Err(e) => {
                    warn!(error = %e, "Malformed XML stream");
                    self.terminate(socket, DisconnectReason::XmlError).await;
                    return Flow::Closed;
                }
            };

            match frame {
                Frame::StreamOpen(header) => self.emit(ConnectorEvent::StreamOpened(header)),
                Frame::StreamClose => {
                    self.emit(ConnectorEvent::StreamClose);
                    if let Err(e) = self.write(socket, STREAM_CLOSE).await {
                        debug!(error = %e, "Failed to answer stream close");
                    }
                    self.terminate(socket, DisconnectReason::None).await;
                    return Flow::Closed;
                }
                Frame::Element(element) => {
                    if element.is("error", ns::STREAM) {
                        warn!(error = %Stanza::new(element.clone()), "Stream error");
                        self.terminate(socket, DisconnectReason::StreamError(element))
                            .await;
                        return Flow::Closed;
                    }
                    if element.is("proceed", ns::TLS) {
                        return match self.start_tls(socket).await {
                            Ok(()) => Flow::Continue,
                            Err(reason) => {
                                self.terminate(socket, reason).await;
                                Flow::Closed
                            }
                        };
                    }
                    if element.is("compressed", ns::COMPRESS) {
                        debug!("Stream compression enabled");
                        self.zlib = Some(ZlibCodec::new());
                        self.flags.compression.store(true, Ordering::Release);
                        self.restart_stream();
                        return Flow::Continue;
                    }
                    if element.is("failure", ns::TLS) || element.is("failure", ns::COMPRESS) {
                        warn!(failure = %Stanza::new(element), "Server refused feature activation");
                        self.terminate(socket, DisconnectReason::None).await;
                        return Flow::Closed;
                    }
                    self.emit(ConnectorEvent::Stanza(Stanza::new(element)));
                }
            }
        }
    }

    fn restart_stream(&mut self) {
        self.framer.reset();
        self.emit(ConnectorEvent::StreamStart);
    }

    async fn start_tls(&mut self, socket: &mut Socket) -> Result<(), DisconnectReason> {
        let Socket::Plain(tcp) = mem::replace(socket, Socket::Closed) else {
            warn!("TLS requested on a socket that is not plain TCP");
            return Err(DisconnectReason::None);
        };

        let config = match &self.options.tls_config {
            Some(config) => config.clone(),
            None => transport::default_tls_config().map_err(|e| {
                warn!(error = %e, "TLS configuration unavailable");
                DisconnectReason::None
            })?,
        };

        let upgraded = timeout(
            self.options.connect_timeout,
            transport::upgrade(tcp, config, &self.domain),
        )
        .await
        .map_err(|_| DisconnectReason::Timeout)?;

        match upgraded {
            Ok(stream) => {
                *socket = Socket::Tls(Box::new(stream));
                self.flags.tls.store(true, Ordering::Release);
                self.bindings.send_replace(socket.channel_bindings());
                debug!("TLS established");
                self.restart_stream();
                Ok(())
            }
            Err(ConnectionError::TlsCertificate(e)) => {
                warn!(error = %e, "Server certificate rejected");
                Err(DisconnectReason::TlsCertError)
            }
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                Err(DisconnectReason::None)
            }
        }
    }

    async fn close(&mut self, socket: &mut Socket, force: bool) {
        if !force {
            self.set_state(ConnectorState::Disconnecting);
            match timeout(self.options.stop_timeout, self.write(socket, STREAM_CLOSE)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Failed to send stream close"),
                Err(_) => debug!("Timed out sending stream close"),
            }
        }
        socket.shutdown().await;
        self.clear_transport();
        self.set_state(ConnectorState::Disconnected(DisconnectReason::None));
    }

    async fn terminate(&mut self, socket: &mut Socket, reason: DisconnectReason) {
        socket.shutdown().await;
        self.clear_transport();
        self.set_state(ConnectorState::Disconnected(reason));
        self.emit(ConnectorEvent::StreamTerminate);
    }

    fn clear_transport(&mut self) {
        self.zlib = None;
        self.framer.reset();
        self.flags.tls.store(false, Ordering::Release);
        self.flags.compression.store(false, Ordering::Release);
        self.bindings.send_replace(ChannelBindings::default());
    }
}

struct ConnectFailure {
    endpoint: Option<ServerEndpoint>,
    reason: DisconnectReason,
    error: ConnectionError,
}

async fn establish(
    options: ConnectorOptions,
    resolver: Arc<dyn ServerResolver>,
    domain: String,
    endpoint: Option<ServerEndpoint>,
) -> Result<(Socket, ServerEndpoint), ConnectFailure> {
    let endpoint = match endpoint.or_else(|| options.server.clone()) {
        Some(endpoint) => endpoint,
        None => select_endpoint(resolver.as_ref(), &domain, options.direct_tls).await,
    };
    debug!(%endpoint, "Opening connection");

    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let tcp = match timeout(options.connect_timeout, connect).await {
        Err(_) => {
            return Err(ConnectFailure {
                endpoint: Some(endpoint),
                reason: DisconnectReason::Timeout,
                error: ConnectionError::Timeout,
            });
        }
        Ok(Err(e)) => {
            let reason = match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::HostUnreachable
                | std::io::ErrorKind::NetworkUnreachable => DisconnectReason::NoRouteToServer,
                _ => DisconnectReason::Timeout,
            };
            return Err(ConnectFailure {
                endpoint: Some(endpoint),
                reason,
                error: e.into(),
            });
        }
        Ok(Ok(tcp)) => tcp,
    };

    if options.tcp_nodelay {
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
    }

    if !endpoint.direct_tls {
        return Ok((Socket::Plain(tcp), endpoint));
    }

    let config = match &options.tls_config {
        Some(config) => config.clone(),
        None => transport::default_tls_config().map_err(|error| ConnectFailure {
            endpoint: None,
            reason: DisconnectReason::None,
            error,
        })?,
    };
    match timeout(options.connect_timeout, transport::upgrade(tcp, config, &domain)).await {
        Ok(Ok(stream)) => Ok((Socket::Tls(Box::new(stream)), endpoint)),
        Ok(Err(error)) => {
            let reason = match error {
                ConnectionError::TlsCertificate(_) => DisconnectReason::TlsCertError,
                _ => DisconnectReason::None,
            };
            Err(ConnectFailure {
                endpoint: Some(endpoint),
                reason,
                error,
            })
        }
        Err(_) => Err(ConnectFailure {
            endpoint: Some(endpoint),
            reason: DisconnectReason::Timeout,
            error: ConnectionError::Timeout,
        }),
    }
}
