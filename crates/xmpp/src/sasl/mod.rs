//! Client-side SASL mechanisms.
//!
//! Every mechanism is a small state machine driven by
//! [`SaslMechanism::evaluate_challenge`]. Instances are created per login
//! attempt from a [`MechanismRegistry`]; anything that must outlive an attempt
//! (cached salted passwords, FAST tokens) lives in the account credentials.

mod anonymous;
mod fast;
mod plain;
mod scram;

use std::sync::Arc;

use hmac::{Hmac, Mac};
use jid::BareJid;
use minidom::Element;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::config::CredentialsStore;
use crate::connector::transport::{ChannelBindingType, ChannelBindings};
use crate::error::{MechanismError, SaslCause, SaslError, XmppError};
use crate::modules::ResetScope;

pub use anonymous::AnonymousMechanism;
pub use fast::{FastMechanism, TokenRequest, parse_token};
pub use plain::PlainMechanism;
pub use scram::{MAX_ITERATIONS, ScramMechanism, encode_sasl_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismStatus {
    New,
    InProgress,
    /// The client sent its final message but has not verified the server yet.
    CompletedExpected,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Name as it appears in mechanism names (`SCRAM-SHA-1`, `HT-SHA-256-NONE`).
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
        }
    }

    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    /// RFC 5802 `Hi()`, which is PBKDF2 with HMAC of this hash.
    pub fn hi(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut output = [0u8; 20];
                pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut output);
                output.to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut output = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
                output.to_vec()
            }
        }
    }
}

/// Everything a mechanism may consult while evaluating.
#[derive(Debug, Clone)]
pub struct MechanismContext {
    pub user_jid: BareJid,
    pub credentials: CredentialsStore,
    pub tls_active: bool,
    pub channel_bindings: ChannelBindings,
    /// Channel-binding types advertised by the server.
    pub server_bindings: Vec<ChannelBindingType>,
    /// FAST mechanisms the server offers inline in SASL2; empty otherwise.
    pub fast_mechanisms: Vec<String>,
}

impl MechanismContext {
    pub fn new(user_jid: BareJid, credentials: CredentialsStore) -> Self {
        Self {
            user_jid,
            credentials,
            tls_active: false,
            channel_bindings: ChannelBindings::default(),
            server_bindings: Vec::new(),
            fast_mechanisms: Vec::new(),
        }
    }

    pub fn localpart(&self) -> Result<String, MechanismError> {
        self.user_jid
            .node()
            .map(|node| node.as_str().to_string())
            .ok_or_else(|| {
                MechanismError::Sasl(SaslError::new(
                    SaslCause::NotAuthorized,
                    Some("account has no local part".to_string()),
                ))
            })
    }

    /// Binding types this side can produce, best first.
    pub fn local_bindings(&self) -> Vec<ChannelBindingType> {
        if !self.tls_active {
            return Vec::new();
        }
        [
            ChannelBindingType::TlsExporter,
            ChannelBindingType::TlsServerEndPoint,
        ]
        .into_iter()
        .filter(|kind| self.channel_bindings.get(*kind).is_ok())
        .collect()
    }

    pub fn channel_binding(&self, kind: ChannelBindingType) -> Result<Vec<u8>, XmppError> {
        self.channel_bindings.get(kind)
    }
}

pub trait SaslMechanism: Send + Sync {
    fn name(&self) -> &str;

    fn status(&self) -> MechanismStatus;

    /// Produce the response to `input` (`None` for the initial response).
    /// Responses and challenges are base64 text as carried on the wire.
    fn evaluate_challenge(
        &mut self,
        input: Option<&str>,
        ctx: &MechanismContext,
    ) -> Result<Option<String>, MechanismError>;

    fn is_allowed_to_use(&self, ctx: &MechanismContext) -> bool;

    fn reset(&mut self, scopes: &[ResetScope]);

    /// True once the last client message has been produced and only the
    /// server's verdict is outstanding.
    fn final_message_sent(&self) -> bool {
        self.status() == MechanismStatus::CompletedExpected
    }

    /// Mechanisms that can answer SASL2 `UPGR-*` tasks.
    fn upgradable(&self) -> Option<&dyn UpgradableMechanism> {
        None
    }

    /// Mechanisms that add inline payloads to SASL2 and only work there.
    fn sasl2_features(&mut self) -> Option<&mut dyn Sasl2FeaturesAware> {
        None
    }

    fn is_sasl2_only(&self) -> bool {
        false
    }
}

pub trait UpgradableMechanism {
    /// Compute the `<hash/>` answer for a `<parameters/>` element.
    fn evaluate_upgrade(
        &self,
        parameters: &Element,
        ctx: &MechanismContext,
    ) -> Result<Element, XmppError>;
}

pub trait Sasl2FeaturesAware {
    /// Payload to embed into `<authenticate/>`, if any.
    fn feature(&mut self, ctx: &MechanismContext) -> Option<Element>;

    /// Inspect the SASL2 `<success/>` element.
    fn process_result(&mut self, result: &Element, ctx: &MechanismContext);
}

pub type MechanismFactory = Arc<dyn Fn() -> Box<dyn SaslMechanism> + Send + Sync>;

/// Named mechanism constructors.
#[derive(Clone, Default)]
pub struct MechanismRegistry {
    factories: Vec<(String, MechanismFactory)>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mechanism this crate implements.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for binding in [
            Some(ChannelBindingType::TlsExporter),
            Some(ChannelBindingType::TlsUnique),
            Some(ChannelBindingType::TlsServerEndPoint),
            None,
        ] {
            registry.register(
                FastMechanism::mechanism_name(HashAlgorithm::Sha256, binding),
                Arc::new(move || Box::new(FastMechanism::new(HashAlgorithm::Sha256, binding))),
            );
        }
        for (hash, plus) in [
            (HashAlgorithm::Sha256, true),
            (HashAlgorithm::Sha256, false),
            (HashAlgorithm::Sha1, true),
            (HashAlgorithm::Sha1, false),
        ] {
            registry.register(
                ScramMechanism::mechanism_name(hash, plus),
                Arc::new(move || Box::new(ScramMechanism::new(hash, plus))),
            );
        }
        registry.register("PLAIN", Arc::new(|| Box::new(PlainMechanism::new())));
        registry.register("ANONYMOUS", Arc::new(|| Box::new(AnonymousMechanism::new())));
        registry
    }

    /// Add or replace the constructor for `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: MechanismFactory) {
        let name = name.into();
        self.factories.retain(|(existing, _)| *existing != name);
        self.factories.push((name, factory));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn SaslMechanism>> {
        self.factories
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, factory)| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(existing, _)| existing == name)
    }

    /// First mechanism in `preference` order that the server supports and
    /// that may be used right now. `accept` filters out mechanisms the
    /// calling profile can't drive.
    pub fn select(
        &self,
        preference: &[String],
        supported: &[String],
        ctx: &MechanismContext,
        accept: impl Fn(&dyn SaslMechanism) -> bool,
    ) -> Option<Box<dyn SaslMechanism>> {
        preference
            .iter()
            .filter(|name| supported.iter().any(|s| s == *name))
            .filter_map(|name| self.create(name))
            .find(|mechanism| accept(mechanism.as_ref()) && mechanism.is_allowed_to_use(ctx))
    }
}

/// Base64 text of an element, treating empty or `=` content as absent.
pub(crate) fn payload(element: &Element) -> Option<String> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        None
    } else {
        Some(text.to_string())
    }
}
