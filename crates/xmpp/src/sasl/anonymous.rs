//! SASL ANONYMOUS (RFC 4505), for accounts without credentials.

use super::{MechanismContext, MechanismStatus, SaslMechanism};
use crate::error::MechanismError;
use crate::modules::ResetScope;

#[derive(Debug)]
pub struct AnonymousMechanism {
    status: MechanismStatus,
}

impl AnonymousMechanism {
    pub fn new() -> Self {
        Self {
            status: MechanismStatus::New,
        }
    }
}

impl Default for AnonymousMechanism {
    fn default() -> Self {
        Self::new()
    }
}

impl SaslMechanism for AnonymousMechanism {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn status(&self) -> MechanismStatus {
        self.status
    }

    fn evaluate_challenge(
        &mut self,
        _input: Option<&str>,
        _ctx: &MechanismContext,
    ) -> Result<Option<String>, MechanismError> {
        self.status = MechanismStatus::Completed;
        Ok(None)
    }

    fn is_allowed_to_use(&self, ctx: &MechanismContext) -> bool {
        ctx.credentials.get().is_empty()
    }

    fn reset(&mut self, _scopes: &[ResetScope]) {
        self.status = MechanismStatus::New;
    }
}
