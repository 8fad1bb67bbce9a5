//! Top-level orchestration of one account's connection.
//!
//! [`SessionLogic`] turns connector events into the client state machine.
//! Three background tasks cooperate through the shared [`Context`]:
//!
//! - the driver consumes [`ConnectorEvent`]s in order. It opens streams,
//!   routes inbound elements through stream management and the response
//!   manager, and handles disconnects and `see-other-host` redirects.
//! - the dispatcher hands the remaining stanzas to modules, one at a time.
//! - the negotiator reacts to every new `<stream:features/>`: TLS first,
//!   then compression, then authentication and finally resumption or
//!   binding.
//!
//! The tasks only hold weak references to the context, so dropping the
//! [`SessionLogic`] shuts everything down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionConfiguration, ConnectorOptions};
use crate::connector::dns::ServerEndpoint;
use crate::connector::framing::stream_header;
use crate::connector::{
    Connector, ConnectorEvent, ConnectorState, DisconnectReason, StreamFeature,
};
use crate::context::{ClientDisconnectReason, ClientState, Context};
use crate::error::{AuthError, ErrorCondition, XmppError};
use crate::modules::{
    AuthModule, AuthState, ModuleManager, PingModule, ResetScope, ResourceBinderModule,
    Sasl2Module, SaslModule, SessionEstablishmentModule, StreamFeatures, StreamFeaturesModule,
    StreamManagementModule,
};
use crate::ns;
use crate::stanza::{Stanza, StanzaKind, StanzaType};

struct Shared {
    redirect: Mutex<Option<ServerEndpoint>>,
    /// Set by a graceful `stop`; the session is over once it completes.
    stopping: AtomicBool,
    /// Bumped on every connection attempt.
    attempt: AtomicU64,
    /// Stanza dispatch is held back while this is `true`.
    authenticating: watch::Sender<bool>,
    inbound: mpsc::UnboundedSender<Stanza>,
}

impl Shared {
    fn take_redirect(&self) -> Option<ServerEndpoint> {
        self.redirect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn set_redirect(&self, endpoint: ServerEndpoint) {
        *self
            .redirect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(endpoint);
    }
}

pub struct SessionLogic {
    ctx: Arc<Context>,
    shared: Arc<Shared>,
}

impl SessionLogic {
    /// Create the session with the default module set. Must be called
    /// within a tokio runtime.
    pub fn new(configuration: ConnectionConfiguration) -> Self {
        let (connector, events) = Connector::new(connector_options(&configuration));
        let ctx = Arc::new(Context::new(configuration, connector));
        register_default_modules(ctx.modules());

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (authenticating, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            redirect: Mutex::new(None),
            stopping: AtomicBool::new(false),
            attempt: AtomicU64::new(0),
            authenticating,
            inbound,
        });

        let features = ctx.module::<StreamFeaturesModule>().subscribe();
        tokio::spawn(drive(Arc::downgrade(&ctx), shared.clone(), events));
        tokio::spawn(dispatch(
            Arc::downgrade(&ctx),
            shared.authenticating.subscribe(),
            inbound_rx,
        ));
        tokio::spawn(negotiate(Arc::downgrade(&ctx), shared.clone(), features));

        Self { ctx, shared }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn state(&self) -> ClientState {
        self.ctx.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.ctx.subscribe_state()
    }

    /// Connect and log in. Ignored unless disconnected.
    pub fn start(&self) {
        if !self.ctx.state().is_disconnected() {
            debug!(jid = %self.ctx.user_jid(), "Already started");
            return;
        }
        self.shared.stopping.store(false, Ordering::Release);
        connect(&self.ctx, &self.shared);
    }

    /// Close the connection and wait until the client is disconnected.
    ///
    /// A graceful stop ends the session on the server, so local session
    /// state is dropped with it. A forced stop only drops the socket and
    /// keeps a resumable session resumable.
    pub async fn stop(&self, force: bool) {
        if self.ctx.state().is_disconnected() {
            return;
        }
        self.shared.stopping.store(!force, Ordering::Release);
        self.ctx.connector().stop(force).await;

        let mut state = self.ctx.subscribe_state();
        let stop_timeout = self.ctx.configuration().connector.stop_timeout;
        if tokio::time::timeout(stop_timeout, state.wait_for(ClientState::is_disconnected))
            .await
            .is_err()
        {
            warn!(jid = %self.ctx.user_jid(), "Client did not report disconnection in time");
        }
    }

    pub async fn send(&self, stanza: Stanza) -> Result<(), XmppError> {
        self.ctx.send(stanza).await
    }

    pub async fn send_iq(&self, stanza: Stanza) -> Result<Stanza, XmppError> {
        self.ctx.send_iq(stanza).await
    }

    /// Check that the server still answers.
    ///
    /// Pings the server when a [`PingModule`] is registered, otherwise
    /// writes a single whitespace. A ping timeout is returned to the caller,
    /// who decides whether to force a reconnect.
    pub async fn keepalive(&self) -> Result<(), XmppError> {
        let Some(ping) = self.ctx.module_or_none::<PingModule>() else {
            if !self.ctx.state().is_connected() {
                return Err(XmppError::with_message(
                    ErrorCondition::NotAuthorized,
                    "You are not connected to the XMPP server",
                ));
            }
            return self
                .ctx
                .connector()
                .send(b" ".to_vec())
                .await
                .map_err(XmppError::from);
        };
        match ping.ping(&self.ctx, None).await {
            Ok(rtt) => {
                trace!(?rtt, "Keepalive answered");
                Ok(())
            }
            Err(error) => {
                if error.condition == ErrorCondition::RemoteServerTimeout {
                    warn!(jid = %self.ctx.user_jid(), "Keepalive timed out, connection may be dead");
                }
                Err(error)
            }
        }
    }
}

fn register_default_modules(modules: &ModuleManager) {
    modules.register(Arc::new(StreamFeaturesModule::new()));
    modules.register(Arc::new(AuthModule::new()));
    modules.register(Arc::new(SaslModule::new()));
    modules.register(Arc::new(Sasl2Module::new()));
    modules.register(Arc::new(ResourceBinderModule::new()));
    modules.register(Arc::new(SessionEstablishmentModule::new()));
    modules.register(Arc::new(StreamManagementModule::default()));
    modules.register(Arc::new(PingModule::new()));
}

fn connect(ctx: &Context, shared: &Shared) {
    let endpoint = shared.take_redirect().or_else(|| {
        ctx.module_or_none::<StreamManagementModule>()
            .filter(|sm| sm.is_resumption_enabled())
            .and_then(|sm| sm.resumption_location())
    });
    if let Some(auth) = ctx.module_or_none::<AuthModule>() {
        auth.set_state(AuthState::NotAuthorized);
    }
    shared.attempt.fetch_add(1, Ordering::AcqRel);
    ctx.set_state(ClientState::Connecting);

    let configuration = ctx.configuration();
    debug!(jid = %configuration.user_jid, ?endpoint, "Connecting");
    ctx.connector().start(configuration.domain(), endpoint);
}

async fn drive(
    ctx: Weak<Context>,
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<ConnectorEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        match event {
            ConnectorEvent::State(state) => match state {
                ConnectorState::Connecting | ConnectorState::Connected => {
                    ctx.set_state(ClientState::Connecting)
                }
                ConnectorState::Disconnecting => ctx.set_state(ClientState::Disconnecting),
                ConnectorState::Disconnected(reason) => disconnected(&ctx, &shared, reason),
            },
            ConnectorEvent::StreamStart => open_stream(&ctx),
            ConnectorEvent::StreamOpened(header) => {
                debug!(id = ?header.id, from = ?header.from, "Server opened stream")
            }
            ConnectorEvent::Stanza(stanza) => route(&ctx, &shared, stanza),
            ConnectorEvent::StreamClose => debug!("Server closed the stream"),
            ConnectorEvent::StreamTerminate => debug!("Stream terminated"),
        }
    }
    trace!("Session driver finished");
}

fn open_stream(ctx: &Context) {
    let configuration = ctx.configuration();
    let from = stream_from(&configuration, ctx.connector().is_tls_active());
    let header = stream_header(configuration.domain(), from.as_deref(), None);
    trace!(%header, "Opening stream");
    ctx.connector().send_nowait(header.into_bytes());
}

/// The account is only named in the stream header when the server may
/// redirect us and the header can't leak it in clear text.
fn stream_from(configuration: &ConnectionConfiguration, tls_active: bool) -> Option<String> {
    let reveal = configuration.use_see_other_host
        && configuration.user_jid.node().is_some()
        && (tls_active || configuration.disable_tls);
    reveal.then(|| configuration.user_jid.to_string())
}

fn route(ctx: &Context, shared: &Shared, stanza: Stanza) {
    if let Some(sm) = ctx.module_or_none::<StreamManagementModule>() {
        if sm.process_incoming(ctx, &stanza) {
            return;
        }
    }
    let own_jid = ctx.user_jid();
    if let Some(continuation) = ctx.responses().continuation(&stanza, Some(&own_jid)) {
        continuation.resolve(stanza);
        return;
    }
    if stanza.kind() == StanzaKind::Iq
        && matches!(
            stanza.stanza_type(),
            Some(StanzaType::Result | StanzaType::Error)
        )
    {
        debug!(id = ?stanza.id(), from = ?stanza.from(), "Dropping unsolicited iq response");
        return;
    }
    if shared.inbound.send(stanza).is_err() {
        debug!("Dispatcher is gone, dropping stanza");
    }
}

fn disconnected(ctx: &Context, shared: &Shared, reason: DisconnectReason) {
    shared.authenticating.send_replace(false);
    let stopping = shared.stopping.swap(false, Ordering::AcqRel);

    if !stopping && ctx.configuration().use_see_other_host {
        if let Some(endpoint) = see_other_host(ctx, &reason) {
            warn!(jid = %ctx.user_jid(), %endpoint, "Server redirected us");
            ctx.reset(&[ResetScope::Stream]);
            ctx.responses().fail_criteria(connection_closed());
            shared.set_redirect(endpoint);
            connect(ctx, shared);
            return;
        }
    }

    // read before the reset forgets it
    let auth_error = match ctx.module_or_none::<AuthModule>().map(|auth| auth.state()) {
        Some(AuthState::Error(error)) => Some(error),
        _ => None,
    };
    let resumable = !stopping
        && ctx
            .module_or_none::<StreamManagementModule>()
            .is_some_and(|sm| sm.is_resumption_enabled());

    if resumable {
        ctx.reset(&[ResetScope::Stream]);
        ctx.responses().fail_criteria(connection_closed());
    } else {
        ctx.reset(&[ResetScope::Stream, ResetScope::Session]);
        ctx.responses().fail_all(connection_closed());
    }

    let reason = match auth_error {
        Some(error) => ClientDisconnectReason::AuthenticationFailure(error),
        None => reason.into(),
    };
    ctx.set_state(ClientState::Disconnected(reason));
}

/// Connector options with direct TLS switched off when TLS is disabled.
fn connector_options(configuration: &ConnectionConfiguration) -> ConnectorOptions {
    let mut options = configuration.connector.clone();
    if configuration.disable_tls {
        options.direct_tls = false;
    }
    options
}

fn see_other_host(ctx: &Context, reason: &DisconnectReason) -> Option<ServerEndpoint> {
    let DisconnectReason::StreamError(error) = reason else {
        return None;
    };
    let location = error
        .get_child("see-other-host", ns::STREAMS_ERRORS)?
        .text();
    ctx.connector().prepare_endpoint(&location)
}

fn connection_closed() -> XmppError {
    XmppError::with_message(ErrorCondition::ServiceUnavailable, "Connection closed")
}

/// Hands stanzas to modules strictly one at a time, in arrival order.
async fn dispatch(
    ctx: Weak<Context>,
    mut authenticating: watch::Receiver<bool>,
    mut inbound: mpsc::UnboundedReceiver<Stanza>,
) {
    let gate = Arc::new(Semaphore::new(1));
    while let Some(stanza) = inbound.recv().await {
        if authenticating.wait_for(|busy| !*busy).await.is_err() {
            break;
        }
        let Ok(permit) = gate.clone().acquire_owned().await else {
            break;
        };
        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            process(&ctx, stanza).await;
            drop(permit);
        });
    }
    trace!("Dispatcher finished");
}

async fn process(ctx: &Arc<Context>, stanza: Stanza) {
    let processors = ctx.modules().find_processors(&stanza);
    if processors.is_empty() {
        if stanza.is_request() {
            reply_error(ctx, &stanza, &XmppError::new(ErrorCondition::FeatureNotImplemented))
                .await;
        } else {
            trace!(name = stanza.name(), "No module for stanza");
        }
        return;
    }
    for module in processors {
        if let Err(error) = module.process(ctx, stanza.clone()).await {
            warn!(%error, name = stanza.name(), id = ?stanza.id(), "Failed to process stanza");
            reply_error(ctx, &stanza, &error).await;
        }
    }
}

async fn reply_error(ctx: &Context, stanza: &Stanza, error: &XmppError) {
    let Some(reply) = stanza.error_result(error) else {
        return;
    };
    if let Err(error) = ctx.send(reply).await {
        warn!(%error, "Failed to send error reply");
    }
}

async fn negotiate(
    ctx: Weak<Context>,
    shared: Arc<Shared>,
    mut features: watch::Receiver<StreamFeatures>,
) {
    while features.changed().await.is_ok() {
        let snapshot = features.borrow_and_update().clone();
        if snapshot.is_none() {
            continue;
        }
        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        let attempt = shared.attempt.load(Ordering::Acquire);
        if let Err(error) = negotiate_features(&ctx, &shared, &snapshot).await {
            // a failure caused by the connection going away needs no stop
            if shared.attempt.load(Ordering::Acquire) == attempt
                && !ctx.connector().state().is_disconnected()
            {
                warn!(jid = %ctx.user_jid(), %error, "Stream negotiation failed, disconnecting");
                ctx.connector().stop(false).await;
            }
        }
    }
    trace!("Negotiator finished");
}

async fn negotiate_features(
    ctx: &Arc<Context>,
    shared: &Shared,
    features: &StreamFeatures,
) -> Result<(), AuthError> {
    let configuration = ctx.configuration();
    let connector = ctx.connector();

    if !connector.is_tls_active() && !configuration.disable_tls && features.supports_starttls() {
        debug!("Starting TLS");
        connector.activate(StreamFeature::Tls);
        return Ok(());
    }
    if !connector.is_compression_active()
        && !configuration.disable_compression
        && features.supports_zlib()
    {
        debug!("Starting zlib compression");
        connector.activate(StreamFeature::Zlib);
        return Ok(());
    }

    let auth = ctx.module_or_none::<AuthModule>().ok_or_else(|| {
        XmppError::with_message(ErrorCondition::UndefinedCondition, "Missing auth module")
    })?;
    if auth.state().is_authorized() {
        return Ok(after_auth(ctx, features).await?);
    }

    if features.supports_sasl() || features.supports_sasl2() {
        shared.authenticating.send_replace(true);
        let result = auth.login(ctx, features).await;
        shared.authenticating.send_replace(false);
        if result? {
            connector.restart_stream();
            return Ok(());
        }
        return Ok(after_auth(ctx, features).await?);
    }
    if features.supports_register() {
        info!(jid = %ctx.user_jid(), "Server only offers in-band registration");
        ctx.set_state(ClientState::Connected { resumed: false });
        return Ok(());
    }
    Err(XmppError::with_message(
        ErrorCondition::NotAuthorized,
        "Server offers no way to authenticate",
    )
    .into())
}

async fn after_auth(ctx: &Arc<Context>, features: &StreamFeatures) -> Result<(), XmppError> {
    let sm = ctx.module_or_none::<StreamManagementModule>();
    if let Some(sm) = &sm {
        sm.process_features(ctx, features).await?;
        if sm.was_resumed() {
            ctx.set_state(ClientState::Connected { resumed: true });
            return Ok(());
        }
    }

    if ctx.bound_jid().is_none() {
        let binder = ctx.module_or_none::<ResourceBinderModule>().ok_or_else(|| {
            XmppError::with_message(ErrorCondition::UndefinedCondition, "Missing bind module")
        })?;
        binder.bind(ctx).await?;
    }
    if features.is_session_required() {
        if let Some(session) = ctx.module_or_none::<SessionEstablishmentModule>() {
            session.establish(ctx).await?;
        }
    }
    if let Some(sm) = &sm {
        sm.process_features(ctx, features).await?;
    }

    ctx.set_state(ClientState::Connected { resumed: false });
    Ok(())
}
