//! RFC 6120 resource binding.

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tracing::info;

use crate::context::Context;
use crate::error::{ErrorCondition, XmppError};
use crate::modules::{ModuleIdentifier, XmppModule};
use crate::ns;
use crate::stanza::{Stanza, StanzaType};

#[derive(Default)]
pub struct ResourceBinderModule;

impl ResourceBinderModule {
    pub fn new() -> Self {
        Self
    }

    /// Bind the configured resource, or let the server pick one.
    pub async fn bind(&self, ctx: &Context) -> Result<Jid, XmppError> {
        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = ctx.configuration().resource {
            bind = bind.append(Element::builder("resource", ns::BIND).append(resource).build());
        }
        let response = ctx
            .send_iq(Stanza::iq(StanzaType::Set, Some(bind.build())))
            .await?;

        let jid = response
            .element()
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("jid", ns::BIND))
            .map(|jid| jid.text())
            .ok_or_else(|| {
                XmppError::with_message(ErrorCondition::BadRequest, "Bind result without jid")
            })?;
        let jid = Jid::new(jid.trim()).map_err(|error| {
            XmppError::with_message(ErrorCondition::BadRequest, format!("Invalid bound jid: {error}"))
        })?;

        info!(%jid, "Resource bound");
        ctx.set_bound_jid(Some(jid.clone()));
        Ok(jid)
    }
}

impl ModuleIdentifier for ResourceBinderModule {
    const ID: &'static str = "urn:ietf:params:xml:ns:xmpp-bind";
}

#[async_trait]
impl XmppModule for ResourceBinderModule {}
