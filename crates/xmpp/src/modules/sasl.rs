//! RFC 6120 SASL negotiation.

use std::time::Duration;

use async_trait::async_trait;
use minidom::Element;
use tracing::debug;

use crate::context::Context;
use crate::criteria::Criteria;
use crate::error::{AuthError, ErrorCondition, SaslCause, SaslError, XmppError};
use crate::modules::auth::expect_authorization;
use crate::modules::{ModuleIdentifier, StreamFeatures, XmppModule};
use crate::ns;
use crate::response::DEFAULT_TIMEOUT;
use crate::sasl::{MechanismContext, MechanismRegistry, MechanismStatus, SaslMechanism, payload};
use crate::stanza::Stanza;

pub struct SaslModule {
    registry: MechanismRegistry,
    timeout: Duration,
}

impl SaslModule {
    pub fn new() -> Self {
        Self::with_registry(MechanismRegistry::with_defaults())
    }

    pub fn with_registry(registry: MechanismRegistry) -> Self {
        Self {
            registry,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn registry(&self) -> &MechanismRegistry {
        &self.registry
    }

    /// Authenticate with the best mechanism from `<mechanisms/>`.
    ///
    /// Mechanisms that only work inside SASL2 are never picked here.
    pub async fn login(&self, ctx: &Context, features: &StreamFeatures) -> Result<(), AuthError> {
        let preference = ctx.configuration().sasl_mechanisms;
        let mctx = ctx.mechanism_context(features);
        let mut mechanism = self
            .registry
            .select(&preference, &features.sasl_mechanisms(), &mctx, |m| {
                !m.is_sasl2_only()
            })
            .ok_or_else(|| {
                SaslError::new(
                    SaslCause::InvalidMechanism,
                    Some("No usable mechanism".to_string()),
                )
            })?;
        debug!(mechanism = mechanism.name(), "Starting SASL authentication");

        let initial = mechanism.evaluate_challenge(None, &mctx)?;
        let mut request = Element::builder("auth", ns::SASL)
            .attr("mechanism", mechanism.name())
            .append(initial.unwrap_or_else(|| "=".to_string()))
            .build();

        loop {
            if mechanism.final_message_sent() {
                expect_authorization(ctx);
            }
            let reply = ctx
                .send_and_wait(Stanza::new(request), replies(), self.timeout)
                .await?;
            let reply = reply.element();
            match reply.name() {
                "success" => return complete(mechanism.as_mut(), reply, &mctx),
                "failure" => {
                    let error = SaslError::from_failure(reply);
                    debug!(mechanism = mechanism.name(), %error, "Server rejected authentication");
                    return Err(error.into());
                }
                _ => {
                    if mechanism.status() == MechanismStatus::Completed {
                        return Err(XmppError::with_message(
                            ErrorCondition::BadRequest,
                            "Authentication is already completed",
                        )
                        .into());
                    }
                    let response = mechanism.evaluate_challenge(payload(reply).as_deref(), &mctx)?;
                    request = Element::builder("response", ns::SASL)
                        .append(response.unwrap_or_default())
                        .build();
                }
            }
        }
    }
}

fn replies() -> Criteria {
    Criteria::names(&["success", "failure", "challenge"]).xmlns(ns::SASL)
}

fn complete(
    mechanism: &mut dyn SaslMechanism,
    success: &Element,
    mctx: &MechanismContext,
) -> Result<(), AuthError> {
    if mechanism.status() != MechanismStatus::Completed {
        mechanism.evaluate_challenge(payload(success).as_deref(), mctx)?;
    }
    if mechanism.status() != MechanismStatus::Completed {
        return Err(SaslError::new(
            SaslCause::ServerNotTrusted,
            Some("Client rejected server response".to_string()),
        )
        .into());
    }
    debug!(mechanism = mechanism.name(), "SASL authentication succeeded");
    Ok(())
}

impl Default for SaslModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleIdentifier for SaslModule {
    const ID: &'static str = "urn:ietf:params:xml:ns:xmpp-sasl";
}

#[async_trait]
impl XmppModule for SaslModule {}
