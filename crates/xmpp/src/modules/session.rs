//! RFC 3921 session establishment, still demanded by some servers.

use async_trait::async_trait;
use minidom::Element;
use tracing::debug;

use crate::context::Context;
use crate::error::XmppError;
use crate::modules::{ModuleIdentifier, XmppModule};
use crate::ns;
use crate::stanza::{Stanza, StanzaType};

#[derive(Default)]
pub struct SessionEstablishmentModule;

impl SessionEstablishmentModule {
    pub fn new() -> Self {
        Self
    }

    pub async fn establish(&self, ctx: &Context) -> Result<(), XmppError> {
        let session = Element::builder("session", ns::SESSION).build();
        ctx.send_iq(Stanza::iq(StanzaType::Set, Some(session))).await?;
        debug!("Session established");
        Ok(())
    }
}

impl ModuleIdentifier for SessionEstablishmentModule {
    const ID: &'static str = "urn:ietf:params:xml:ns:xmpp-session";
}

#[async_trait]
impl XmppModule for SessionEstablishmentModule {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::testing::connected_context;

    #[tokio::test]
    async fn establish_sends_session_iq() {
        let (ctx, mut server) = connected_context(Credentials::with_password("pass")).await;
        let establish = tokio::spawn({
            let ctx = ctx.clone();
            async move { SessionEstablishmentModule::new().establish(&ctx).await }
        });

        let request = server.expect().await;
        assert_eq!(request.attr("type"), Some("set"));
        assert!(request.get_child("session", ns::SESSION).is_some());
        server
            .send(&format!(
                "<iq xmlns='jabber:client' type='result' id='{}'/>",
                request.attr("id").unwrap()
            ))
            .await;

        establish.await.unwrap().unwrap();
    }
}
