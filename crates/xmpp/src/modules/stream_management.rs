//! Stream management (XEP-0198): acknowledgements and stream resumption.
//!
//! The inbound side runs synchronously on the session's receive path, ahead
//! of response correlation and module dispatch, so counting starts with the
//! very first stanza after `<enabled/>` or `<resumed/>`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::connector::Connector;
use crate::connector::dns::ServerEndpoint;
use crate::context::Context;
use crate::criteria::Criteria;
use crate::error::{ErrorCondition, XmppError};
use crate::modules::{
    InlineStage, ModuleIdentifier, ResetScope, Sasl2Inline, StreamFeatures, XmppModule,
};
use crate::ns;
use crate::response::DEFAULT_TIMEOUT;
use crate::stanza::{Stanza, StanzaKind};

/// Unacked stanzas tolerated before an ack is requested unprompted.
const UNACKED_REQUEST_THRESHOLD: usize = 3;
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// What to negotiate once the resource is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamManagementMode {
    None,
    Ack,
    #[default]
    Resumption,
}

type Delivery = oneshot::Sender<Result<(), XmppError>>;

struct Unacked {
    data: Vec<u8>,
    delivery: Option<Delivery>,
}

struct State {
    mode: StreamManagementMode,
    ack_enabled: bool,
    resumption_id: Option<String>,
    resumption_location: Option<ServerEndpoint>,
    resumption_time: Option<Duration>,
    was_resumed: bool,
    incoming: u32,
    last_sent_h: u32,
    acked: u32,
    queue: VecDeque<Unacked>,
    last_request: Instant,
    ack_task: Option<JoinHandle<()>>,
    inline_resume: bool,
    inline_enable: bool,
}

impl State {
    fn new(mode: StreamManagementMode) -> Self {
        Self {
            mode,
            ack_enabled: false,
            resumption_id: None,
            resumption_location: None,
            resumption_time: None,
            was_resumed: false,
            incoming: 0,
            last_sent_h: 0,
            acked: 0,
            queue: VecDeque::new(),
            last_request: Instant::now(),
            ack_task: None,
            inline_resume: false,
            inline_enable: false,
        }
    }

    /// Settle everything the server confirmed with `h`.
    fn acknowledge(&mut self, h: u32) {
        let newly_acked = h.wrapping_sub(self.acked) as usize;
        if newly_acked > self.queue.len() {
            warn!(
                h,
                acked = self.acked,
                unacked = self.queue.len(),
                "Server acked more stanzas than were sent"
            );
        }
        let count = newly_acked.min(self.queue.len());
        for item in self.queue.drain(..count) {
            if let Some(delivery) = item.delivery {
                let _ = delivery.send(Ok(()));
            }
        }
        self.acked = h;
        trace!(h, unacked = self.queue.len(), "Ack processed");
    }

    fn ack_element(&mut self, force: bool) -> Option<Element> {
        if !force && self.last_sent_h == self.incoming {
            return None;
        }
        self.last_sent_h = self.incoming;
        Some(
            Element::builder("a", ns::SM)
                .attr("h", self.incoming.to_string())
                .build(),
        )
    }

    fn enable_element(&self, max_resumption_timeout: Option<u32>) -> Element {
        let mut enable = Element::builder("enable", ns::SM);
        if self.mode == StreamManagementMode::Resumption {
            enable = enable.attr("resume", "true");
            if let Some(max) = max_resumption_timeout {
                enable = enable.attr("max", max.to_string());
            }
        }
        enable.build()
    }

    fn resume_element(&self) -> Element {
        let mut resume = Element::builder("resume", ns::SM).attr("h", self.incoming.to_string());
        if let Some(id) = &self.resumption_id {
            resume = resume.attr("previd", id.as_str());
        }
        resume.build()
    }
}

pub struct StreamManagementModule {
    state: Arc<Mutex<State>>,
    max_resumption_timeout: Option<u32>,
    ack_delay: Duration,
}

impl StreamManagementModule {
    pub fn new(
        mode: StreamManagementMode,
        max_resumption_timeout: Option<u32>,
        ack_delay: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new(mode))),
            max_resumption_timeout,
            ack_delay,
        }
    }

    pub fn mode(&self) -> StreamManagementMode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: StreamManagementMode) {
        self.lock().mode = mode;
    }

    /// Acks are exchanged on the current stream.
    pub fn is_enabled(&self) -> bool {
        self.lock().ack_enabled
    }

    pub fn is_resumption_enabled(&self) -> bool {
        self.lock().resumption_id.is_some()
    }

    pub fn was_resumed(&self) -> bool {
        self.lock().was_resumed
    }

    /// Where the server asked to be contacted for resumption.
    pub fn resumption_location(&self) -> Option<ServerEndpoint> {
        self.lock().resumption_location.clone()
    }

    /// How long the server keeps the session resumable.
    pub fn resumption_time(&self) -> Option<Duration> {
        self.lock().resumption_time
    }

    pub fn unacked(&self) -> usize {
        self.lock().queue.len()
    }

    /// Inspect an inbound element before anything else sees it.
    ///
    /// Returns `true` when the element was an ack exchange that needs no
    /// further processing.
    pub fn process_incoming(&self, ctx: &Context, stanza: &Stanza) -> bool {
        let element = stanza.element();
        if element.ns() == ns::SM {
            return match element.name() {
                "enabled" => {
                    self.process_enabled(ctx, element);
                    false
                }
                "resumed" => {
                    self.process_resumed(ctx, element);
                    false
                }
                "a" => {
                    if let Some(h) = element.attr("h").and_then(|h| h.parse().ok()) {
                        self.lock().acknowledge(h);
                    }
                    true
                }
                "r" => {
                    self.schedule_ack(ctx.connector(), true);
                    true
                }
                _ => false,
            };
        }
        if element.is("success", ns::SASL2) {
            self.process_sasl2_success(ctx, element);
            return false;
        }

        if stanza.kind() == StanzaKind::Other {
            return false;
        }
        let counted = {
            let mut state = self.lock();
            if state.ack_enabled {
                state.incoming = state.incoming.wrapping_add(1);
            }
            state.ack_enabled
        };
        if counted {
            self.schedule_ack(ctx.connector(), false);
        }
        false
    }

    /// Queue an outgoing stanza until the server acks it.
    ///
    /// Returns whether an ack should be requested after the write, and for
    /// messages with an id a receiver that resolves on acknowledgement.
    pub fn process_outgoing(
        &self,
        stanza: &Stanza,
        data: &[u8],
    ) -> (bool, Option<oneshot::Receiver<Result<(), XmppError>>>) {
        if stanza.kind() == StanzaKind::Other {
            return (false, None);
        }
        let mut state = self.lock();
        if !state.ack_enabled {
            return (false, None);
        }

        if stanza.kind() == StanzaKind::Message && stanza.id().is_some() {
            let (delivery, receiver) = oneshot::channel();
            state.queue.push_back(Unacked {
                data: data.to_vec(),
                delivery: Some(delivery),
            });
            state.last_request = Instant::now();
            return (true, Some(receiver));
        }

        state.queue.push_back(Unacked {
            data: data.to_vec(),
            delivery: None,
        });
        let request = state.queue.len() > UNACKED_REQUEST_THRESHOLD
            && state.last_request.elapsed() >= MIN_REQUEST_INTERVAL;
        if request {
            state.last_request = Instant::now();
        }
        (request, None)
    }

    /// Ask the server for an ack.
    pub fn request(&self, ctx: &Context) {
        self.lock().last_request = Instant::now();
        send_element(ctx.connector(), Element::builder("r", ns::SM).build());
    }

    /// Send an ack unless the current count was already reported.
    pub fn send_ack(&self, ctx: &Context) {
        let ack = self.lock().ack_element(false);
        if let Some(ack) = ack {
            send_element(ctx.connector(), ack);
        }
    }

    /// Resume or enable stream management once authenticated.
    ///
    /// A failed resumption starts a fresh session: session state is dropped
    /// so the caller binds a new resource. Enabling only happens once a
    /// resource is bound.
    pub async fn process_features(
        &self,
        ctx: &Context,
        features: &StreamFeatures,
    ) -> Result<(), XmppError> {
        if !features.supports_stream_management() || self.is_enabled() {
            return Ok(());
        }
        if self.is_resumption_enabled() {
            if let Err(error) = self.resume(ctx).await {
                warn!(%error, "Stream resumption failed, starting a new session");
                ctx.reset(&[ResetScope::Session]);
            }
            return Ok(());
        }
        if ctx.bound_jid().is_none() {
            return Ok(());
        }
        match self.mode() {
            StreamManagementMode::None => Ok(()),
            mode => {
                if let Err(error) = self.enable(ctx).await {
                    warn!(%error, ?mode, "Server refused stream management");
                }
                Ok(())
            }
        }
    }

    /// Send `<enable/>` according to the configured mode.
    pub async fn enable(&self, ctx: &Context) -> Result<(), XmppError> {
        let enable = {
            let state = self.lock();
            if state.ack_enabled || state.resumption_id.is_some() {
                return Err(XmppError::new(ErrorCondition::UnexpectedRequest));
            }
            state.enable_element(self.max_resumption_timeout)
        };
        debug!(enable = %Stanza::new(enable.clone()), "Enabling stream management");
        let response = ctx
            .send_and_wait(
                Stanza::new(enable),
                Criteria::names(&["enabled", "failed"]).xmlns(ns::SM),
                DEFAULT_TIMEOUT,
            )
            .await?;
        match response.name() {
            // already applied on the receive path
            "enabled" => Ok(()),
            _ => Err(self.process_failed(response.element())),
        }
    }

    /// Send `<resume/>` for the previous session.
    pub async fn resume(&self, ctx: &Context) -> Result<(), XmppError> {
        let resume = self.lock().resume_element();
        debug!("Resuming stream");
        let response = ctx
            .send_and_wait(
                Stanza::new(resume),
                Criteria::names(&["resumed", "failed"]).xmlns(ns::SM),
                DEFAULT_TIMEOUT,
            )
            .await?;
        match response.name() {
            "resumed" => Ok(()),
            _ => Err(self.process_failed(response.element())),
        }
    }

    fn process_enabled(&self, ctx: &Context, enabled: &Element) {
        let resumable = matches!(enabled.attr("resume"), Some("true" | "1"));
        let location = enabled
            .attr("location")
            .and_then(|location| ctx.connector().prepare_endpoint(location));
        let mut state = self.lock();
        state.ack_enabled = true;
        state.incoming = 0;
        state.last_sent_h = 0;
        state.acked = 0;
        if resumable {
            state.resumption_id = enabled.attr("id").map(str::to_string);
        }
        state.resumption_location = location;
        state.resumption_time = enabled
            .attr("max")
            .and_then(|max| max.parse().ok())
            .map(Duration::from_secs);
        debug!(
            resumable = state.resumption_id.is_some(),
            max = ?state.resumption_time,
            "Stream management enabled"
        );
    }

    fn process_resumed(&self, ctx: &Context, resumed: &Element) {
        let h = resumed.attr("h").and_then(|h| h.parse().ok());
        let resend: Vec<Vec<u8>> = {
            let mut state = self.lock();
            state.ack_enabled = true;
            state.was_resumed = true;
            if let Some(h) = h {
                state.acknowledge(h);
            }
            state.queue.iter().map(|item| item.data.clone()).collect()
        };
        debug!(resent = resend.len(), "Stream resumed");
        for data in resend {
            ctx.connector().send_nowait(data);
        }
    }

    fn process_failed(&self, failed: &Element) -> XmppError {
        self.reset_state(&[ResetScope::Stream, ResetScope::Session]);
        let condition = failed
            .children()
            .filter(|child| child.ns() == ns::STANZAS)
            .find_map(|child| ErrorCondition::from_name(child.name()))
            .unwrap_or(ErrorCondition::UndefinedCondition);
        debug!(%condition, "Stream management request failed");
        XmppError::new(condition)
    }

    fn process_sasl2_success(&self, ctx: &Context, success: &Element) {
        let (inline_resume, inline_enable) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.inline_resume),
                std::mem::take(&mut state.inline_enable),
            )
        };
        if inline_resume {
            if let Some(resumed) = success.get_child("resumed", ns::SM) {
                self.process_resumed(ctx, resumed);
            } else if success.get_child("failed", ns::SM).is_some() {
                debug!("Inline stream resumption failed");
                ctx.reset(&[ResetScope::Session]);
            }
        }
        if inline_enable {
            match success
                .get_child("bound", ns::BIND2)
                .and_then(|bound| bound.get_child("enabled", ns::SM))
            {
                Some(enabled) => self.process_enabled(ctx, enabled),
                None => self.reset_state(&[ResetScope::Stream, ResetScope::Session]),
            }
        }
    }

    fn schedule_ack(&self, connector: &Connector, force: bool) {
        let mut state = self.lock();
        if !force && state.ack_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shared = self.state.clone();
        let connector = connector.clone();
        let delay = self.ack_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let ack = {
                let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if !state.ack_enabled {
                    return;
                }
                state.ack_element(force)
            };
            if let Some(ack) = ack {
                send_element(&connector, ack);
            }
        });
        if !force {
            state.ack_task = Some(task);
        }
    }

    fn reset_state(&self, scopes: &[ResetScope]) {
        let mut state = self.lock();
        if let Some(task) = state.ack_task.take() {
            task.abort();
        }
        if scopes.contains(&ResetScope::Stream) {
            state.ack_enabled = false;
            state.was_resumed = false;
            state.inline_resume = false;
            state.inline_enable = false;
        }
        if scopes.contains(&ResetScope::Session) {
            state.ack_enabled = false;
            state.was_resumed = false;
            state.resumption_id = None;
            state.resumption_location = None;
            state.resumption_time = None;
            state.incoming = 0;
            state.last_sent_h = 0;
            state.acked = 0;
            for item in state.queue.drain(..) {
                if let Some(delivery) = item.delivery {
                    let _ = delivery.send(Err(XmppError::new(ErrorCondition::ServiceUnavailable)));
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StreamManagementModule {
    fn default() -> Self {
        Self::new(
            StreamManagementMode::default(),
            None,
            Duration::from_millis(100),
        )
    }
}

fn send_element(connector: &Connector, element: Element) {
    match Stanza::new(element).to_bytes() {
        Ok(data) => connector.send_nowait(data),
        Err(e) => warn!(error = %e, "Failed to serialize stream management element"),
    }
}

impl ModuleIdentifier for StreamManagementModule {
    const ID: &'static str = "urn:xmpp:sm:3";
}

#[async_trait]
impl XmppModule for StreamManagementModule {
    fn reset(&self, _ctx: &Context, scopes: &[ResetScope]) {
        self.reset_state(scopes);
    }

    fn as_sasl2_inline(&self) -> Option<&dyn Sasl2Inline> {
        Some(self)
    }
}

impl Sasl2Inline for StreamManagementModule {
    fn inline_feature(
        &self,
        _ctx: &Context,
        stage: InlineStage,
        features: &StreamFeatures,
    ) -> Option<Element> {
        let mut state = self.lock();
        match stage {
            InlineStage::AfterSasl => {
                if state.resumption_id.is_none() || !features.supports_sasl2_inline("sm", ns::SM) {
                    return None;
                }
                state.inline_resume = true;
                Some(state.resume_element())
            }
            InlineStage::AfterBind => {
                let offered = features
                    .bind2_inline_features()
                    .iter()
                    .any(|var| var == ns::SM);
                if state.mode == StreamManagementMode::None || !offered {
                    return None;
                }
                state.inline_enable = true;
                Some(state.enable_element(self.max_resumption_timeout))
            }
        }
    }
}
