//! XEP-0199 XMPP Ping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tokio::time::Instant;
use tracing::trace;

use crate::context::Context;
use crate::criteria::Criteria;
use crate::error::{ErrorCondition, XmppError};
use crate::modules::{ModuleIdentifier, XmppModule};
use crate::ns;
use crate::stanza::{Stanza, StanzaType};

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(120);

pub struct PingModule {
    timeout: Duration,
}

impl PingModule {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PING_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Ping `jid`, or the account's server when `None`, returning the round
    /// trip time.
    ///
    /// An entity that answers with `feature-not-implemented` is alive all the
    /// same.
    pub async fn ping(&self, ctx: &Context, jid: Option<Jid>) -> Result<Duration, XmppError> {
        let mut iq = Stanza::iq(
            StanzaType::Get,
            Some(Element::builder("ping", ns::PING).build()),
        );
        iq.set_to(jid.as_ref());

        let started = Instant::now();
        match ctx.send_iq_with_timeout(iq, self.timeout).await {
            Ok(_) => {}
            Err(error) if error.condition == ErrorCondition::FeatureNotImplemented => {}
            Err(error) => return Err(error),
        }
        let elapsed = started.elapsed();
        trace!(?jid, ?elapsed, "Pong");
        Ok(elapsed)
    }
}

impl Default for PingModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleIdentifier for PingModule {
    const ID: &'static str = ns::PING;
}

#[async_trait]
impl XmppModule for PingModule {
    fn features(&self) -> &[&'static str] {
        &[ns::PING]
    }

    fn criteria(&self) -> Option<Criteria> {
        Some(
            Criteria::name("iq")
                .xmlns(ns::JABBER_CLIENT)
                .with_child(Criteria::name("ping").xmlns(ns::PING)),
        )
    }

    async fn process(&self, ctx: &Arc<Context>, stanza: Stanza) -> Result<(), XmppError> {
        match stanza.stanza_type() {
            Some(StanzaType::Get) => ctx.send(stanza.result_reply()).await,
            _ => Err(XmppError::new(ErrorCondition::BadRequest)),
        }
    }
}
