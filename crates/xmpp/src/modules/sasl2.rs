//! Extensible SASL Profile (XEP-0388) with Bind 2.0, FAST and SCRAM upgrade
//! tasks.

use std::time::Duration;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tracing::{debug, warn};

use crate::config::UserAgent;
use crate::context::Context;
use crate::criteria::Criteria;
use crate::error::{AuthError, ErrorCondition, SaslCause, SaslError, XmppError};
use crate::modules::auth::expect_authorization;
use crate::modules::{InlineStage, ModuleIdentifier, StreamFeatures, XmppModule};
use crate::ns;
use crate::response::DEFAULT_TIMEOUT;
use crate::sasl::{
    MechanismContext, MechanismRegistry, MechanismStatus, SaslMechanism, TokenRequest, payload,
};
use crate::stanza::Stanza;

/// Bind 2.0 tag identifying this client software.
pub const DEFAULT_BIND_TAG: &str = "skua";

const UPGRADE_PREFIX: &str = "UPGR-";

pub struct Sasl2Module {
    registry: MechanismRegistry,
    bind_tag: String,
    should_bind: bool,
    should_upgrade: bool,
    timeout: Duration,
}

impl Sasl2Module {
    pub fn new() -> Self {
        Self::with_registry(MechanismRegistry::with_defaults())
    }

    pub fn with_registry(registry: MechanismRegistry) -> Self {
        Self {
            registry,
            bind_tag: DEFAULT_BIND_TAG.to_string(),
            should_bind: true,
            should_upgrade: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_bind_tag(mut self, tag: impl Into<String>) -> Self {
        self.bind_tag = tag.into();
        self
    }

    /// Whether to request Bind 2.0 when the server offers it.
    pub fn with_bind(mut self, should_bind: bool) -> Self {
        self.should_bind = should_bind;
        self
    }

    /// Whether to request `UPGR-*` tasks for SCRAM mechanisms.
    pub fn with_upgrades(mut self, should_upgrade: bool) -> Self {
        self.should_upgrade = should_upgrade;
        self
    }

    pub fn registry(&self) -> &MechanismRegistry {
        &self.registry
    }

    /// Authenticate with the best mechanism from `<authentication/>`.
    ///
    /// A FAST attempt rejected by the server drops the token and is retried
    /// once with the next usable mechanism. A failure of that retry is
    /// reported as `temporary-auth-failure`.
    pub async fn login(&self, ctx: &Context, features: &StreamFeatures) -> Result<(), AuthError> {
        let preference = ctx.configuration().sasl_mechanisms;
        let mut retried = false;
        loop {
            let mctx = ctx.mechanism_context(features);
            let result = match self.registry.select(
                &preference,
                &features.sasl2_mechanisms(),
                &mctx,
                |_| true,
            ) {
                Some(mechanism) => {
                    let fast = mechanism.is_sasl2_only();
                    let name = mechanism.name().to_string();
                    self.authenticate(ctx, features, mechanism, &mctx)
                        .await
                        .map_err(|error| (error, fast, name))
                }
                None => Err((no_usable_mechanism(), false, String::new())),
            };

            let (error, fast, mechanism) = match result {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };
            if retried {
                return Err(SaslError::new(
                    SaslCause::TemporaryAuthFailure,
                    Some(error.to_string()),
                )
                .into());
            }
            if !fast || !is_recoverable(&error) {
                return Err(error);
            }
            warn!(%mechanism, %error, "FAST authentication failed, retrying without token");
            mctx.credentials.update(|credentials| credentials.fast_token = None);
            retried = true;
        }
    }

    async fn authenticate(
        &self,
        ctx: &Context,
        features: &StreamFeatures,
        mut mechanism: Box<dyn SaslMechanism>,
        mctx: &MechanismContext,
    ) -> Result<(), AuthError> {
        debug!(mechanism = mechanism.name(), "Starting SASL2 authentication");
        let initial = mechanism.evaluate_challenge(None, mctx)?;
        let token_request = if mechanism.is_sasl2_only() {
            None
        } else {
            TokenRequest::select(&self.registry, &ctx.configuration().sasl_mechanisms, mctx)
        };

        let request = self.authenticate_request(
            ctx,
            features,
            mechanism.as_mut(),
            mctx,
            initial,
            token_request.as_ref(),
        );
        let mut reply = self.exchange(ctx, mechanism.as_ref(), request, replies()).await?;

        loop {
            let name = reply.name().to_string();
            match name.as_str() {
                "success" => {
                    return self.process_success(
                        ctx,
                        mechanism.as_mut(),
                        &reply,
                        mctx,
                        token_request.as_ref(),
                    );
                }
                "failure" => {
                    let error = SaslError::from_failure(&reply);
                    debug!(mechanism = mechanism.name(), %error, "Server rejected authentication");
                    return Err(error.into());
                }
                "challenge" => {
                    if mechanism.status() == MechanismStatus::Completed {
                        return Err(XmppError::with_message(
                            ErrorCondition::BadRequest,
                            "Authentication is already completed",
                        )
                        .into());
                    }
                    let response = mechanism.evaluate_challenge(payload(&reply).as_deref(), mctx)?;
                    let request = Element::builder("response", ns::SASL2)
                        .append(response.unwrap_or_default())
                        .build();
                    reply = self.exchange(ctx, mechanism.as_ref(), request, replies()).await?;
                }
                "continue" => {
                    reply = self
                        .process_continue(ctx, mechanism.as_mut(), &reply, mctx)
                        .await?;
                }
                other => {
                    return Err(XmppError::with_message(
                        ErrorCondition::FeatureNotImplemented,
                        format!("Unexpected SASL2 element <{other}/>"),
                    )
                    .into());
                }
            }
        }
    }

    fn authenticate_request(
        &self,
        ctx: &Context,
        features: &StreamFeatures,
        mechanism: &mut dyn SaslMechanism,
        mctx: &MechanismContext,
        initial: Option<String>,
        token_request: Option<&TokenRequest>,
    ) -> Element {
        let configuration = ctx.configuration();
        let mut authenticate = Element::builder("authenticate", ns::SASL2)
            .attr("mechanism", mechanism.name())
            .build();

        if let Some(initial) = initial {
            authenticate.append_child(
                Element::builder("initial-response", ns::SASL2)
                    .append(initial)
                    .build(),
            );
        }
        if self.should_upgrade && configuration.credentials.get().password.is_some() {
            for upgrade in self.upgrades(&configuration.sasl_mechanisms, features) {
                authenticate.append_child(
                    Element::builder("upgrade", ns::SASL_UPGRADE)
                        .append(format!("{UPGRADE_PREFIX}{upgrade}"))
                        .build(),
                );
            }
        }
        authenticate.append_child(user_agent(&configuration.user_agent, configuration.resource));

        for inline in ctx.modules().sasl2_inline(ctx, InlineStage::AfterSasl, features) {
            authenticate.append_child(inline);
        }
        if let Some(feature) = mechanism
            .sasl2_features()
            .and_then(|aware| aware.feature(mctx))
        {
            authenticate.append_child(feature);
        }
        if let Some(token_request) = token_request {
            authenticate.append_child(token_request.element());
        }
        if self.should_bind && features.supports_bind2() {
            let mut bind = Element::builder("bind", ns::BIND2)
                .append(
                    Element::builder("tag", ns::BIND2)
                        .append(self.bind_tag.as_str())
                        .build(),
                )
                .build();
            for inline in ctx.modules().sasl2_inline(ctx, InlineStage::AfterBind, features) {
                bind.append_child(inline);
            }
            authenticate.append_child(bind);
        }
        authenticate
    }

    /// Upgrade tasks offered by the server that a configured mechanism can
    /// answer.
    fn upgrades(&self, preference: &[String], features: &StreamFeatures) -> Vec<String> {
        features
            .sasl2_upgrades()
            .into_iter()
            .filter(|name| preference.contains(name))
            .filter(|name| {
                self.registry
                    .create(name)
                    .is_some_and(|mechanism| mechanism.upgradable().is_some())
            })
            .collect()
    }

    async fn exchange(
        &self,
        ctx: &Context,
        mechanism: &dyn SaslMechanism,
        request: Element,
        criteria: Criteria,
    ) -> Result<Element, AuthError> {
        if mechanism.final_message_sent() {
            expect_authorization(ctx);
        }
        let reply = ctx
            .send_and_wait(Stanza::new(request), criteria, self.timeout)
            .await?;
        Ok(reply.into_element())
    }

    async fn process_continue(
        &self,
        ctx: &Context,
        mechanism: &mut dyn SaslMechanism,
        reply: &Element,
        mctx: &MechanismContext,
    ) -> Result<Element, AuthError> {
        verify_server(mechanism, reply, mctx)?;

        let tasks: Vec<String> = reply
            .get_child("tasks", ns::SASL2)
            .map(|tasks| {
                tasks
                    .children()
                    .filter(|child| child.name() == "task")
                    .map(|task| task.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let Some(upgrade) = tasks
            .iter()
            .find_map(|task| task.strip_prefix(UPGRADE_PREFIX))
        else {
            return Err(XmppError::with_message(
                ErrorCondition::FeatureNotImplemented,
                format!("Required unsupported SASL2 tasks: {}", tasks.join(", ")),
            )
            .into());
        };

        let Some(upgrader) = self
            .registry
            .create(upgrade)
            .filter(|candidate| candidate.upgradable().is_some())
        else {
            return Err(XmppError::with_message(
                ErrorCondition::FeatureNotImplemented,
                format!("Requested upgrade to unsupported mechanism: {upgrade}"),
            )
            .into());
        };
        debug!(mechanism = upgrade, "Performing SASL2 upgrade task");

        let next = Element::builder("next", ns::SASL2)
            .attr("task", format!("{UPGRADE_PREFIX}{upgrade}"))
            .build();
        let data = self
            .exchange(
                ctx,
                mechanism,
                next,
                Criteria::names(&["task-data", "success", "failure"]).xmlns(ns::SASL2),
            )
            .await?;
        if data.name() != "task-data" {
            return Ok(data);
        }

        let hash = match upgrader.upgradable() {
            Some(upgradable) => upgradable.evaluate_upgrade(&data, mctx)?,
            None => return Err(XmppError::new(ErrorCondition::FeatureNotImplemented).into()),
        };
        let response = Element::builder("task-data", ns::SASL2)
            .append(hash)
            .build();
        self.exchange(ctx, mechanism, response, replies()).await
    }

    fn process_success(
        &self,
        ctx: &Context,
        mechanism: &mut dyn SaslMechanism,
        success: &Element,
        mctx: &MechanismContext,
        token_request: Option<&TokenRequest>,
    ) -> Result<(), AuthError> {
        verify_server(mechanism, success, mctx)?;

        if let Some(aware) = mechanism.sasl2_features() {
            aware.process_result(success, mctx);
        }
        if let Some(token_request) = token_request {
            if !token_request.process_result(success, &mctx.credentials) {
                debug!(mechanism = %token_request.mechanism, "Server issued no FAST token");
            }
        }
        if success.get_child("bound", ns::BIND2).is_some() {
            let jid = success
                .get_child("authorization-identifier", ns::SASL2)
                .and_then(|identifier| Jid::new(identifier.text().trim()).ok());
            ctx.set_bound_jid(jid);
        }
        debug!(mechanism = mechanism.name(), "SASL2 authentication succeeded");
        Ok(())
    }
}

fn replies() -> Criteria {
    Criteria::names(&["success", "failure", "challenge", "continue"]).xmlns(ns::SASL2)
}

/// Feed `<additional-data/>` to the mechanism and require it to accept the
/// server.
fn verify_server(
    mechanism: &mut dyn SaslMechanism,
    reply: &Element,
    mctx: &MechanismContext,
) -> Result<(), AuthError> {
    if mechanism.status() != MechanismStatus::Completed {
        let data = reply
            .get_child("additional-data", ns::SASL2)
            .and_then(payload);
        mechanism.evaluate_challenge(data.as_deref(), mctx)?;
    }
    if mechanism.status() != MechanismStatus::Completed {
        return Err(SaslError::new(
            SaslCause::ServerNotTrusted,
            Some("Client rejected server response".to_string()),
        )
        .into());
    }
    Ok(())
}

fn user_agent(agent: &UserAgent, resource: Option<String>) -> Element {
    let mut element = Element::builder("user-agent", ns::SASL2).build();
    if let Some(id) = &agent.id {
        element.set_attr("id", id.as_str());
    }
    if let Some(software) = &agent.software {
        element.append_child(
            Element::builder("software", ns::SASL2)
                .append(software.as_str())
                .build(),
        );
    }
    if let Some(device) = agent.device.clone().or(resource) {
        element.append_child(Element::builder("device", ns::SASL2).append(device).build());
    }
    element
}

fn no_usable_mechanism() -> AuthError {
    SaslError::new(
        SaslCause::InvalidMechanism,
        Some("No usable mechanism".to_string()),
    )
    .into()
}

fn is_recoverable(error: &AuthError) -> bool {
    matches!(
        error.sasl_cause(),
        Some(SaslCause::NotAuthorized | SaslCause::InvalidMechanism | SaslCause::ServerNotTrusted)
    )
}

impl Default for Sasl2Module {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleIdentifier for Sasl2Module {
    const ID: &'static str = "urn:xmpp:sasl:2";
}

#[async_trait]
impl XmppModule for Sasl2Module {}
