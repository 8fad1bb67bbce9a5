//! FAST (XEP-0484): token-based re-authentication over SASL2.
//!
//! The `HT-*` mechanisms prove possession of a server-issued token with an
//! HMAC over optional channel-binding data. Tokens are requested inline with
//! a regular SASL2 login and kept in the account credentials.

use base64::prelude::*;
use chrono::{DateTime, Utc};
use minidom::Element;
use tracing::debug;

use super::{
    HashAlgorithm, MechanismContext, MechanismRegistry, MechanismStatus, Sasl2FeaturesAware,
    SaslMechanism,
};
use crate::config::{CredentialsStore, FastToken};
use crate::connector::transport::ChannelBindingType;
use crate::error::{MechanismError, SaslCause, SaslError};
use crate::modules::ResetScope;
use crate::ns;

#[derive(Debug)]
pub struct FastMechanism {
    name: String,
    hash: HashAlgorithm,
    binding: Option<ChannelBindingType>,
    status: MechanismStatus,
}

impl FastMechanism {
    pub fn new(hash: HashAlgorithm, binding: Option<ChannelBindingType>) -> Self {
        Self {
            name: Self::mechanism_name(hash, binding),
            hash,
            binding,
            status: MechanismStatus::New,
        }
    }

    pub fn mechanism_name(hash: HashAlgorithm, binding: Option<ChannelBindingType>) -> String {
        let suffix = match binding {
            Some(ChannelBindingType::TlsExporter) => "EXPR",
            Some(ChannelBindingType::TlsUnique) => "UNIQ",
            Some(ChannelBindingType::TlsServerEndPoint) => "ENDP",
            None => "NONE",
        };
        format!("HT-{}-{}", hash.name(), suffix)
    }

    /// Binding data for this variant; empty for `-NONE`.
    fn binding_data(&self, ctx: &MechanismContext) -> Result<Vec<u8>, MechanismError> {
        match self.binding {
            Some(kind) => Ok(ctx.channel_binding(kind)?),
            None => Ok(Vec::new()),
        }
    }

    fn binding_available(&self, ctx: &MechanismContext) -> bool {
        self.binding
            .is_none_or(|kind| ctx.tls_active && ctx.channel_binding(kind).is_ok())
    }

    fn token(&self, ctx: &MechanismContext) -> Result<FastToken, MechanismError> {
        ctx.credentials
            .get()
            .fast_token
            .filter(|token| token.mechanism == self.name)
            .ok_or_else(|| {
                SaslError::new(
                    SaslCause::InvalidMechanism,
                    Some("Missing FAST token".to_string()),
                )
                .into()
            })
    }
}

impl SaslMechanism for FastMechanism {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> MechanismStatus {
        self.status
    }

    fn evaluate_challenge(
        &mut self,
        input: Option<&str>,
        ctx: &MechanismContext,
    ) -> Result<Option<String>, MechanismError> {
        let token = self.token(ctx)?;
        let mut data = match input {
            Some(_) => b"Responder".to_vec(),
            None => b"Initiator".to_vec(),
        };
        data.extend(self.binding_data(ctx)?);
        let expected = self.hash.hmac(token.value.as_bytes(), &data);

        match input {
            None => {
                let mut message = ctx.localpart()?.into_bytes();
                message.push(0);
                message.extend(expected);
                self.status = MechanismStatus::InProgress;
                Ok(Some(BASE64_STANDARD.encode(message)))
            }
            Some(input) => {
                let response = BASE64_STANDARD.decode(input).map_err(|_| {
                    MechanismError::BadChallenge("Response not properly encoded".to_string())
                })?;
                if response != expected {
                    return Err(MechanismError::InvalidServerSignature);
                }
                self.status = MechanismStatus::Completed;
                Ok(None)
            }
        }
    }

    fn is_allowed_to_use(&self, ctx: &MechanismContext) -> bool {
        if !ctx.fast_mechanisms.iter().any(|name| *name == self.name) {
            return false;
        }
        let usable = ctx
            .credentials
            .get()
            .fast_token
            .is_some_and(|token| token.is_usable_for(&self.name, Utc::now()));
        usable && self.binding_available(ctx)
    }

    fn reset(&mut self, scopes: &[ResetScope]) {
        if scopes.contains(&ResetScope::Stream) {
            self.status = MechanismStatus::New;
        }
    }

    fn sasl2_features(&mut self) -> Option<&mut dyn Sasl2FeaturesAware> {
        Some(self)
    }

    fn is_sasl2_only(&self) -> bool {
        true
    }
}

impl Sasl2FeaturesAware for FastMechanism {
    fn feature(&mut self, _ctx: &MechanismContext) -> Option<Element> {
        (self.status == MechanismStatus::InProgress)
            .then(|| Element::builder("fast", ns::FAST).build())
    }

    fn process_result(&mut self, result: &Element, ctx: &MechanismContext) {
        // the server may rotate the token it just accepted
        if let Some((value, expires_at)) = parse_token(result) {
            store_token(&ctx.credentials, &self.name, value, expires_at);
        }
    }
}

/// A `<request-token/>` for the best FAST mechanism the server offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub mechanism: String,
}

impl TokenRequest {
    /// Pick the first FAST mechanism in `preference` that the server offers
    /// inline and whose channel binding is available.
    pub fn select(
        registry: &MechanismRegistry,
        preference: &[String],
        ctx: &MechanismContext,
    ) -> Option<Self> {
        preference
            .iter()
            .filter(|name| ctx.fast_mechanisms.contains(name))
            .find(|name| {
                registry
                    .create(name)
                    .is_some_and(|mechanism| mechanism.is_sasl2_only() && binding_ready(name, ctx))
            })
            .map(|name| Self {
                mechanism: name.clone(),
            })
    }

    pub fn element(&self) -> Element {
        Element::builder("request-token", ns::FAST)
            .attr("mechanism", self.mechanism.as_str())
            .build()
    }

    /// Store the token carried by a SASL2 `<success/>`, if any.
    pub fn process_result(&self, result: &Element, credentials: &CredentialsStore) -> bool {
        match parse_token(result) {
            Some((value, expires_at)) => {
                store_token(credentials, &self.mechanism, value, expires_at);
                true
            }
            None => false,
        }
    }
}

fn binding_ready(name: &str, ctx: &MechanismContext) -> bool {
    let kind = if name.ends_with("-EXPR") {
        Some(ChannelBindingType::TlsExporter)
    } else if name.ends_with("-ENDP") {
        Some(ChannelBindingType::TlsServerEndPoint)
    } else if name.ends_with("-UNIQ") {
        Some(ChannelBindingType::TlsUnique)
    } else {
        None
    };
    kind.is_none_or(|kind| ctx.tls_active && ctx.channel_binding(kind).is_ok())
}

fn store_token(
    credentials: &CredentialsStore,
    mechanism: &str,
    value: String,
    expires_at: DateTime<Utc>,
) {
    debug!(mechanism, %expires_at, "Received FAST token");
    credentials.update(|c| {
        c.fast_token = Some(FastToken {
            mechanism: mechanism.to_string(),
            value,
            expires_at,
        })
    });
}

/// `<token expiry='...' token='...'/>` inside a SASL2 success element.
pub fn parse_token(result: &Element) -> Option<(String, DateTime<Utc>)> {
    let token = result.get_child("token", ns::FAST)?;
    let value = token.attr("token")?.to_string();
    let expires_at = DateTime::parse_from_rfc3339(token.attr("expiry")?)
        .ok()?
        .with_timezone(&Utc);
    Some((value, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use jid::BareJid;

    fn context_with_token(mechanism: &str, valid_for: TimeDelta) -> MechanismContext {
        let mut ctx = MechanismContext::new(
            BareJid::new("user@example.com").unwrap(),
            CredentialsStore::new(Credentials {
                fast_token: Some(FastToken {
                    mechanism: mechanism.to_string(),
                    value: "secret-token".to_string(),
                    expires_at: Utc::now() + valid_for,
                }),
                ..Credentials::default()
            }),
        );
        ctx.fast_mechanisms = vec![mechanism.to_string()];
        ctx
    }

    #[test]
    fn names_follow_binding() {
        assert_eq!(
            FastMechanism::mechanism_name(HashAlgorithm::Sha256, None),
            "HT-SHA-256-NONE"
        );
        assert_eq!(
            FastMechanism::mechanism_name(
                HashAlgorithm::Sha256,
                Some(ChannelBindingType::TlsExporter)
            ),
            "HT-SHA-256-EXPR"
        );
    }

    #[test]
    fn exchange_verifies_server_response() {
        let ctx = context_with_token("HT-SHA-256-NONE", TimeDelta::hours(1));
        let mut fast = FastMechanism::new(HashAlgorithm::Sha256, None);
        assert!(fast.is_allowed_to_use(&ctx));

        let first = fast.evaluate_challenge(None, &ctx).unwrap().unwrap();
        let decoded = BASE64_STANDARD.decode(first).unwrap();
        let mut expected = b"user\0".to_vec();
        expected.extend(HashAlgorithm::Sha256.hmac(b"secret-token", b"Initiator"));
        assert_eq!(decoded, expected);
        assert_eq!(fast.status(), MechanismStatus::InProgress);
        assert_eq!(
            fast.feature(&ctx).map(|el| el.name().to_string()).as_deref(),
            Some("fast")
        );

        let responder =
            BASE64_STANDARD.encode(HashAlgorithm::Sha256.hmac(b"secret-token", b"Responder"));
        assert_eq!(fast.evaluate_challenge(Some(&responder), &ctx).unwrap(), None);
        assert_eq!(fast.status(), MechanismStatus::Completed);
    }

    #[test]
    fn wrong_server_response_is_rejected() {
        let ctx = context_with_token("HT-SHA-256-NONE", TimeDelta::hours(1));
        let mut fast = FastMechanism::new(HashAlgorithm::Sha256, None);
        fast.evaluate_challenge(None, &ctx).unwrap();
        assert_matches!(
            fast.evaluate_challenge(Some("AAAA"), &ctx),
            Err(MechanismError::InvalidServerSignature)
        );
    }

    #[test]
    fn token_must_outlive_ten_seconds() {
        let fast = FastMechanism::new(HashAlgorithm::Sha256, None);
        assert!(!fast.is_allowed_to_use(&context_with_token(
            "HT-SHA-256-NONE",
            TimeDelta::seconds(10)
        )));
        assert!(fast.is_allowed_to_use(&context_with_token(
            "HT-SHA-256-NONE",
            TimeDelta::seconds(30)
        )));
        assert!(!fast.is_allowed_to_use(&context_with_token(
            "HT-SHA-256-ENDP",
            TimeDelta::hours(1)
        )));
    }

    #[test]
    fn missing_token_is_invalid_mechanism() {
        let ctx = MechanismContext::new(
            BareJid::new("user@example.com").unwrap(),
            CredentialsStore::new(Credentials::with_password("x")),
        );
        let mut fast = FastMechanism::new(HashAlgorithm::Sha256, None);
        assert_matches!(
            fast.evaluate_challenge(None, &ctx),
            Err(MechanismError::Sasl(SaslError { cause: SaslCause::InvalidMechanism, .. }))
        );
    }

    #[test]
    fn bound_variant_needs_binding_data() {
        let mut ctx = context_with_token("HT-SHA-256-EXPR", TimeDelta::hours(1));
        let fast = FastMechanism::new(HashAlgorithm::Sha256, Some(ChannelBindingType::TlsExporter));
        assert!(!fast.is_allowed_to_use(&ctx));
        ctx.tls_active = true;
        ctx.channel_bindings.exporter = Some(vec![9; 32]);
        assert!(fast.is_allowed_to_use(&ctx));
    }

    #[test]
    fn token_request_picks_first_offered() {
        let registry = MechanismRegistry::with_defaults();
        let mut ctx = MechanismContext::new(
            BareJid::new("user@example.com").unwrap(),
            CredentialsStore::new(Credentials::with_password("x")),
        );
        ctx.fast_mechanisms = vec!["HT-SHA-256-EXPR".to_string(), "HT-SHA-256-NONE".to_string()];
        let preference: Vec<String> = ["HT-SHA-256-EXPR", "HT-SHA-256-NONE", "PLAIN"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        // no TLS, so the exporter variant can't be used later
        let request = TokenRequest::select(&registry, &preference, &ctx).unwrap();
        assert_eq!(request.mechanism, "HT-SHA-256-NONE");
        assert_eq!(request.element().attr("mechanism"), Some("HT-SHA-256-NONE"));

        let success: Element = format!(
            "<success xmlns='{}'><token xmlns='{}' expiry='2030-01-01T00:00:00Z' token='new-token'/></success>",
            ns::SASL2,
            ns::FAST
        )
        .parse()
        .unwrap();
        assert!(request.process_result(&success, &ctx.credentials));
        let token = ctx.credentials.get().fast_token.unwrap();
        assert_eq!(token.mechanism, "HT-SHA-256-NONE");
        assert_eq!(token.value, "new-token");

        ctx.fast_mechanisms.clear();
        assert_eq!(TokenRequest::select(&registry, &preference, &ctx), None);
    }
}
