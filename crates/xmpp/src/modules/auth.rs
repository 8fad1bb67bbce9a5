//! Authentication orchestration: picks SASL2 or legacy SASL for a stream.

use std::mem;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{AuthError, ErrorCondition, XmppError};
use crate::modules::{
    ModuleIdentifier, ResetScope, Sasl2Module, SaslModule, StreamFeatures, XmppModule,
};

#[derive(Debug, Clone)]
pub enum AuthState {
    NotAuthorized,
    InProgress,
    /// The client sent its last message and waits for the server's verdict.
    ExpectedAuthorization,
    Authorized {
        stream_restart_required: bool,
    },
    Error(AuthError),
}

impl AuthState {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthState::Authorized { .. })
    }
}

/// States compare by kind only.
impl PartialEq for AuthState {
    fn eq(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl Eq for AuthState {}

pub struct AuthModule {
    state: watch::Sender<AuthState>,
}

impl AuthModule {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AuthState::NotAuthorized);
        Self { state }
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: AuthState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            debug!(?state, "Authentication state changed");
        }
    }

    /// Authenticate the current stream.
    ///
    /// SASL2 is used when the server offers it and a [`Sasl2Module`] is
    /// registered; legacy SASL otherwise. Returns whether the stream has to
    /// be restarted before continuing.
    pub async fn login(&self, ctx: &Context, features: &StreamFeatures) -> Result<bool, AuthError> {
        self.set_state(AuthState::InProgress);
        let result = self.run(ctx, features).await;
        match &result {
            Ok(stream_restart_required) => {
                info!(jid = %ctx.user_jid(), "Authenticated");
                self.set_state(AuthState::Authorized {
                    stream_restart_required: *stream_restart_required,
                });
            }
            Err(error) => {
                warn!(jid = %ctx.user_jid(), %error, "Authentication failed");
                self.set_state(AuthState::Error(error.clone()));
            }
        }
        result
    }

    async fn run(&self, ctx: &Context, features: &StreamFeatures) -> Result<bool, AuthError> {
        if features.supports_sasl2() {
            if let Some(sasl2) = ctx.module_or_none::<Sasl2Module>() {
                sasl2.login(ctx, features).await?;
                return Ok(false);
            }
        }
        if let Some(sasl) = ctx.module_or_none::<SaslModule>() {
            sasl.login(ctx, features).await?;
            return Ok(true);
        }
        Err(XmppError::with_message(
            ErrorCondition::UndefinedCondition,
            "Missing SASL authentication module",
        )
        .into())
    }
}

impl Default for AuthModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleIdentifier for AuthModule {
    const ID: &'static str = "auth";
}

#[async_trait]
impl XmppModule for AuthModule {
    fn reset(&self, _ctx: &Context, scopes: &[ResetScope]) {
        if scopes.contains(&ResetScope::Stream) {
            self.set_state(AuthState::NotAuthorized);
        }
    }
}

/// Record that the mechanism sent its final message.
pub(crate) fn expect_authorization(ctx: &Context) {
    if let Some(auth) = ctx.module_or_none::<AuthModule>() {
        auth.set_state(AuthState::ExpectedAuthorization);
    }
}
