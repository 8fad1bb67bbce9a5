//! State shared by the session logic and every module of one account.

use std::mem;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ConnectionConfiguration, CredentialsStore};
use crate::connector::{Connector, DisconnectReason};
use crate::criteria::Criteria;
use crate::error::{AuthError, ErrorCondition, XmppError};
use crate::modules::{
    ModuleIdentifier, ModuleManager, ResetScope, StreamFeatures, StreamManagementModule,
    XmppModule,
};
use crate::response::{DEFAULT_TIMEOUT, ResponseManager};
use crate::sasl::MechanismContext;
use crate::stanza::{Stanza, StanzaType};

/// Why the client is disconnected.
#[derive(Debug, Clone)]
pub enum ClientDisconnectReason {
    None,
    Timeout,
    TlsCertError,
    XmlError,
    StreamError(Element),
    NoRouteToServer,
    AuthenticationFailure(AuthError),
}

impl From<DisconnectReason> for ClientDisconnectReason {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::None => ClientDisconnectReason::None,
            DisconnectReason::Timeout => ClientDisconnectReason::Timeout,
            DisconnectReason::TlsCertError => ClientDisconnectReason::TlsCertError,
            DisconnectReason::XmlError => ClientDisconnectReason::XmlError,
            DisconnectReason::StreamError(element) => ClientDisconnectReason::StreamError(element),
            DisconnectReason::NoRouteToServer => ClientDisconnectReason::NoRouteToServer,
        }
    }
}

/// Externally visible state of the client.
#[derive(Debug, Clone)]
pub enum ClientState {
    Connecting,
    Connected { resumed: bool },
    Disconnecting,
    Disconnected(ClientDisconnectReason),
}

impl ClientState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ClientState::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ClientState::Disconnected(_))
    }
}

/// States compare by kind only.
impl PartialEq for ClientState {
    fn eq(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl Eq for ClientState {}

pub struct Context {
    configuration: RwLock<ConnectionConfiguration>,
    bound_jid: RwLock<Option<Jid>>,
    connector: Connector,
    responses: ResponseManager,
    modules: ModuleManager,
    state: watch::Sender<ClientState>,
    // keeps stream management bookkeeping in wire order
    write_order: Mutex<()>,
}

impl Context {
    pub fn new(configuration: ConnectionConfiguration, connector: Connector) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected(ClientDisconnectReason::None));
        Self {
            configuration: RwLock::new(configuration),
            bound_jid: RwLock::new(None),
            connector,
            responses: ResponseManager::new(),
            modules: ModuleManager::new(),
            state,
            write_order: Mutex::new(()),
        }
    }

    pub fn configuration(&self) -> ConnectionConfiguration {
        self.configuration
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration. Switching to another account drops every
    /// piece of stream and session state.
    pub fn set_configuration(&self, configuration: ConnectionConfiguration) {
        let account_changed = {
            let mut current = self
                .configuration
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = current.user_jid != configuration.user_jid;
            *current = configuration;
            changed
        };
        if account_changed {
            info!(jid = %self.user_jid(), "Account changed, resetting state");
            self.reset(&[ResetScope::Stream, ResetScope::Session]);
        }
    }

    pub fn user_jid(&self) -> BareJid {
        self.configuration
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .user_jid
            .clone()
    }

    pub fn credentials(&self) -> CredentialsStore {
        self.configuration
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .credentials
            .clone()
    }

    /// Full JID assigned to this session by the server.
    pub fn bound_jid(&self) -> Option<Jid> {
        self.bound_jid
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_bound_jid(&self, jid: Option<Jid>) {
        debug!(bound_jid = ?jid.as_ref().map(|j| j.to_string()), "Bound JID changed");
        *self
            .bound_jid
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = jid;
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn responses(&self) -> &ResponseManager {
        &self.responses
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    /// See [`ModuleManager::module`].
    pub fn module<T: XmppModule + ModuleIdentifier>(&self) -> Arc<T> {
        self.modules.module::<T>()
    }

    pub fn module_or_none<T: XmppModule + ModuleIdentifier>(&self) -> Option<Arc<T>> {
        self.modules.module_or_none::<T>()
    }

    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            info!(jid = %self.user_jid(), ?state, "Client state changed");
        }
    }

    /// Drop state of the given scopes in every module.
    ///
    /// Pending responses are left alone; whoever closes the connection fails
    /// them.
    pub fn reset(&self, scopes: &[ResetScope]) {
        debug!(?scopes, "Resetting state");
        self.modules.reset(self, scopes);
        if scopes.contains(&ResetScope::Session) {
            self.set_bound_jid(None);
        }
    }

    /// Inputs for SASL mechanisms on the current stream.
    pub fn mechanism_context(&self, features: &StreamFeatures) -> MechanismContext {
        let configuration = self.configuration();
        MechanismContext {
            tls_active: self.connector.is_tls_active(),
            channel_bindings: self.connector.channel_bindings(),
            server_bindings: features.channel_bindings(),
            fast_mechanisms: features.fast_mechanisms(),
            ..MechanismContext::new(configuration.user_jid, configuration.credentials)
        }
    }

    /// Send a stanza or nonza.
    ///
    /// Only allowed while connecting or connected. When stream management
    /// tracks delivery of the stanza, this waits for the server's ack instead
    /// of the socket write.
    pub async fn send(&self, stanza: Stanza) -> Result<(), XmppError> {
        let state = self.state();
        if !matches!(state, ClientState::Connected { .. } | ClientState::Connecting) {
            return Err(XmppError::with_message(
                ErrorCondition::NotAuthorized,
                "You are not connected to the XMPP server",
            ));
        }

        let data = stanza.to_bytes()?;
        let stream_management = self.module_or_none::<StreamManagementModule>();
        let (request_ack, delivery, written) = {
            let _order = self
                .write_order
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let (request_ack, delivery) = match &stream_management {
                Some(sm) => sm.process_outgoing(&stanza, &data),
                None => (false, None),
            };
            (request_ack, delivery, self.connector.enqueue(data))
        };
        if request_ack {
            if let Some(sm) = &stream_management {
                sm.request(self);
            }
        }

        match delivery {
            Some(delivery) => delivery.await.unwrap_or_else(|_| {
                Err(XmppError::with_message(
                    ErrorCondition::ServiceUnavailable,
                    "delivery tracking was dropped",
                ))
            }),
            None => match written.await {
                Ok(result) => result.map_err(XmppError::from),
                Err(_) => Err(XmppError::with_message(
                    ErrorCondition::ServiceUnavailable,
                    "connector is gone",
                )),
            },
        }
    }

    /// Send an iq request and wait for its result.
    pub async fn send_iq(&self, stanza: Stanza) -> Result<Stanza, XmppError> {
        self.send_iq_with_timeout(stanza, DEFAULT_TIMEOUT).await
    }

    /// Send an iq request and wait for its result. An `error` reply is
    /// returned as the error it carries.
    pub async fn send_iq_with_timeout(
        &self,
        mut stanza: Stanza,
        timeout: Duration,
    ) -> Result<Stanza, XmppError> {
        if stanza.id().is_none() {
            stanza.set_id(Uuid::new_v4().to_string());
        }
        let pending = self.responses.register_iq(&stanza)?;
        let key = pending.key().clone();
        if let Err(error) = self.send(stanza).await {
            self.responses.cancel(&key, error.clone());
            return Err(error);
        }
        let response = self.responses.wait(pending, timeout).await?;
        if response.stanza_type() == Some(StanzaType::Error) {
            return Err(XmppError::from_error_element(response.element()));
        }
        Ok(response)
    }

    /// Send `stanza` and wait for the first inbound element matching
    /// `criteria`.
    pub async fn send_and_wait(
        &self,
        stanza: Stanza,
        criteria: Criteria,
        timeout: Duration,
    ) -> Result<Stanza, XmppError> {
        let pending = self.responses.register_criteria(criteria);
        let key = pending.key().clone();
        if let Err(error) = self.send(stanza).await {
            self.responses.cancel(&key, error.clone());
            return Err(error);
        }
        self.responses.wait(pending, timeout).await
    }
}
