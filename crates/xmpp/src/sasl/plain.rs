//! SASL PLAIN (RFC 4616).

use base64::prelude::*;

use super::{MechanismContext, MechanismStatus, SaslMechanism};
use crate::error::{MechanismError, SaslCause, SaslError};
use crate::modules::ResetScope;

#[derive(Debug)]
pub struct PlainMechanism {
    status: MechanismStatus,
}

impl PlainMechanism {
    pub fn new() -> Self {
        Self {
            status: MechanismStatus::New,
        }
    }
}

impl Default for PlainMechanism {
    fn default() -> Self {
        Self::new()
    }
}

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn status(&self) -> MechanismStatus {
        self.status
    }

    fn evaluate_challenge(
        &mut self,
        input: Option<&str>,
        ctx: &MechanismContext,
    ) -> Result<Option<String>, MechanismError> {
        if self.status == MechanismStatus::Completed {
            return match input {
                None => Ok(None),
                Some(_) => Err(MechanismError::Generic(
                    "Mechanism is already completed".to_string(),
                )),
            };
        }
        if matches!(
            self.status,
            MechanismStatus::InProgress | MechanismStatus::CompletedExpected
        ) {
            self.status = MechanismStatus::Completed;
            return Ok(None);
        }

        let credentials = ctx.credentials.get();
        let Some(password) = credentials.password else {
            return Err(SaslError::new(
                SaslCause::NotAuthorized,
                Some("No password provided".to_string()),
            )
            .into());
        };
        let authcid = match credentials.authentication_name {
            Some(name) => name,
            None => ctx.localpart()?,
        };

        let mut message = Vec::with_capacity(authcid.len() + password.len() + 2);
        message.push(0);
        message.extend_from_slice(authcid.as_bytes());
        message.push(0);
        message.extend_from_slice(password.as_bytes());

        self.status = MechanismStatus::InProgress;
        Ok(Some(BASE64_STANDARD.encode(message)))
    }

    fn final_message_sent(&self) -> bool {
        self.status == MechanismStatus::InProgress
    }

    fn is_allowed_to_use(&self, ctx: &MechanismContext) -> bool {
        ctx.credentials.get().password.is_some()
    }

    fn reset(&mut self, _scopes: &[ResetScope]) {
        self.status = MechanismStatus::New;
    }
}
