//! SCRAM-SHA-1 and SCRAM-SHA-256, with and without channel binding.
//!
//! Client side of RFC 5802 / RFC 7677:
//!
//! 1. `n,,n=user,r=clientnonce` (or `p=<binding>,,...` for `-PLUS`)
//! 2. server-first `r=clientnonce+servernonce,s=salt,i=iterations`
//! 3. `c=<gs2 + binding data>,r=nonce,p=clientproof`
//! 4. server-final `v=serversignature`, verified before reporting success
//!
//! Salted passwords are cached in the credentials so later logins with the
//! same salt and iteration count skip the PBKDF2 work.

use std::sync::LazyLock;

use base64::prelude::*;
use minidom::Element;
use rand::Rng;
use regex::Regex;
use tracing::debug;

use super::{
    HashAlgorithm, MechanismContext, MechanismStatus, SaslMechanism, UpgradableMechanism,
};
use crate::config::SaltedPassword;
use crate::error::{ErrorCondition, MechanismError, SaslCause, SaslError, XmppError};
use crate::modules::ResetScope;
use crate::ns;

/// Highest iteration count accepted from a server.
pub const MAX_ITERATIONS: u32 = 1_000_000;

const NONCE_LENGTH: usize = 20;
const NONCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

static SERVER_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(m=[^\x00=]+,)?r=([\x21-\x2B\x2D-\x7E]+),s=([a-zA-Z0-9/+=]+),i=(\d+)(?:,.*)?$",
    )
    .expect("server-first pattern is valid")
});

static SERVER_FINAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:e=([^,]+)|v=([a-zA-Z0-9/+=]+)(?:,.*)?)$")
        .expect("server-final pattern is valid")
});

/// Scratch state of one exchange.
#[derive(Debug, Default)]
struct Exchange {
    stage: u8,
    client_nonce: String,
    gs2_header: String,
    binding_data: Vec<u8>,
    client_first_bare: String,
    auth_message: String,
    salted_password: Vec<u8>,
}

#[derive(Debug)]
pub struct ScramMechanism {
    name: String,
    hash: HashAlgorithm,
    plus: bool,
    /// Cache computed salted passwords in the credentials.
    pub store_salted_password: bool,
    status: MechanismStatus,
    exchange: Option<Exchange>,
    fixed_nonce: Option<String>,
}

impl ScramMechanism {
    pub fn new(hash: HashAlgorithm, plus: bool) -> Self {
        Self {
            name: Self::mechanism_name(hash, plus),
            hash,
            plus,
            store_salted_password: true,
            status: MechanismStatus::New,
            exchange: None,
            fixed_nonce: None,
        }
    }

    pub fn mechanism_name(hash: HashAlgorithm, plus: bool) -> String {
        format!("SCRAM-{}{}", hash.name(), if plus { "-PLUS" } else { "" })
    }

    pub fn supports_channel_binding(&self) -> bool {
        self.plus
    }

    #[cfg(test)]
    fn with_client_nonce(mut self, nonce: &str) -> Self {
        self.fixed_nonce = Some(nonce.to_string());
        self
    }

    fn client_first(&mut self, ctx: &MechanismContext) -> Result<Option<String>, MechanismError> {
        let client_nonce = self.fixed_nonce.clone().unwrap_or_else(random_nonce);
        let mut gs2_header = "n,,".to_string();
        let mut binding_data = Vec::new();

        if self.plus {
            let local = ctx.local_bindings();
            if let Some(binding) = local
                .into_iter()
                .find(|binding| ctx.server_bindings.contains(binding))
            {
                match ctx.channel_binding(binding) {
                    Ok(data) => {
                        gs2_header = format!("p={},,", binding.as_str());
                        binding_data = data;
                    }
                    Err(e) if e.condition == ErrorCondition::FeatureNotImplemented => {
                        debug!(binding = binding.as_str(), "Channel binding data unavailable");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let client_first_bare = format!(
            "n={},r={}",
            encode_sasl_name(&ctx.localpart()?),
            client_nonce
        );
        let message = format!("{gs2_header}{client_first_bare}");

        self.exchange = Some(Exchange {
            stage: 1,
            client_nonce,
            gs2_header,
            binding_data,
            client_first_bare,
            ..Exchange::default()
        });
        self.status = MechanismStatus::InProgress;
        Ok(Some(BASE64_STANDARD.encode(message)))
    }

    fn client_final(
        &mut self,
        input: Option<&str>,
        ctx: &MechanismContext,
    ) -> Result<Option<String>, MechanismError> {
        let message = decode_challenge(input)?;
        let captures = SERVER_FIRST
            .captures(&message)
            .ok_or_else(|| MechanismError::BadChallenge("Failed to parse challenge".to_string()))?;
        let nonce = &captures[2];
        let salt = BASE64_STANDARD
            .decode(&captures[3])
            .map_err(|_| MechanismError::BadChallenge("Invalid encoding of salt".to_string()))?;
        let iterations: u32 = captures[4]
            .parse()
            .ok()
            .filter(|i| (1..=MAX_ITERATIONS).contains(i))
            .ok_or_else(|| {
                MechanismError::BadChallenge("Invalid number of iterations".to_string())
            })?;

        let client_nonce = self
            .exchange
            .as_ref()
            .map(|exchange| exchange.client_nonce.as_str())
            .ok_or_else(|| MechanismError::Generic("Exchange was not started".to_string()))?;
        if !nonce.starts_with(client_nonce) {
            return Err(MechanismError::WrongNonce);
        }

        let salted_password = self.prepare_salted_password(ctx, &salt, iterations)?;
        let hash = self.hash;
        let exchange = self
            .exchange
            .as_mut()
            .ok_or_else(|| MechanismError::Generic("Exchange was not started".to_string()))?;

        let mut channel = exchange.gs2_header.as_bytes().to_vec();
        channel.extend_from_slice(&exchange.binding_data);
        let without_proof = format!("c={},r={}", BASE64_STANDARD.encode(channel), nonce);
        exchange.auth_message = format!(
            "{},{},{}",
            exchange.client_first_bare, message, without_proof
        );

        let client_key = hash.hmac(&salted_password, b"Client Key");
        let stored_key = hash.digest(&client_key);
        let client_signature = hash.hmac(&stored_key, exchange.auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        exchange.salted_password = salted_password;
        exchange.stage = 2;
        self.status = MechanismStatus::CompletedExpected;
        Ok(Some(BASE64_STANDARD.encode(format!(
            "{},p={}",
            without_proof,
            BASE64_STANDARD.encode(proof)
        ))))
    }

    fn verify_server_final(&mut self, input: Option<&str>) -> Result<(), MechanismError> {
        let message = decode_challenge(input)?;
        let captures = SERVER_FINAL
            .captures(&message)
            .ok_or_else(|| MechanismError::BadChallenge("Failed to parse challenge".to_string()))?;
        if let Some(error) = captures.get(1) {
            return Err(MechanismError::BadChallenge(format!(
                "Server reported error: {}",
                error.as_str()
            )));
        }
        let signature = captures
            .get(2)
            .and_then(|v| BASE64_STANDARD.decode(v.as_str()).ok())
            .ok_or_else(|| MechanismError::BadChallenge("Invalid value of 'v'".to_string()))?;

        let exchange = self
            .exchange
            .as_ref()
            .ok_or_else(|| MechanismError::Generic("Exchange was not started".to_string()))?;
        let server_key = self.hash.hmac(&exchange.salted_password, b"Server Key");
        let expected = self.hash.hmac(&server_key, exchange.auth_message.as_bytes());
        if signature != expected {
            return Err(MechanismError::InvalidServerSignature);
        }
        Ok(())
    }

    fn prepare_salted_password(
        &self,
        ctx: &MechanismContext,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Vec<u8>, MechanismError> {
        let id = SaltedPassword::generate_id(&self.name, iterations, salt);
        let credentials = ctx.credentials.get();
        if let Some(cached) = credentials.salted_password.filter(|cached| cached.id == id) {
            return Ok(cached.value);
        }
        let Some(password) = credentials.password else {
            return Err(SaslError::new(
                SaslCause::NotAuthorized,
                Some("Password and salted password were not specified".to_string()),
            )
            .into());
        };
        let value = self.hash.hi(password.as_bytes(), salt, iterations);
        if self.store_salted_password {
            let stored = value.clone();
            ctx.credentials
                .update(|c| c.salted_password = Some(SaltedPassword { id, value: stored }));
        }
        Ok(value)
    }
}

impl SaslMechanism for ScramMechanism {
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
        if self.status == MechanismStatus::Completed {
            return match input {
                None => Ok(None),
                Some(_) => Err(MechanismError::Generic(
                    "Client in illegal state - already authorized".to_string(),
                )),
            };
        }

        match self.exchange.as_ref().map_or(0, |exchange| exchange.stage) {
            0 => self.client_first(ctx),
            1 => self.client_final(input, ctx),
            _ => match self.verify_server_final(input) {
                Ok(()) => {
                    self.status = MechanismStatus::Completed;
                    self.exchange = None;
                    Ok(None)
                }
                Err(e) => {
                    if self.store_salted_password {
                        ctx.credentials.update(|c| c.salted_password = None);
                    }
                    Err(e)
                }
            },
        }
    }

    fn is_allowed_to_use(&self, ctx: &MechanismContext) -> bool {
        let credentials = ctx.credentials.get();
        if credentials.password.is_none() && credentials.salted_password.is_none() {
            return false;
        }
        !self.plus || !ctx.server_bindings.is_empty()
    }

    fn reset(&mut self, scopes: &[ResetScope]) {
        if scopes.contains(&ResetScope::Stream) {
            self.status = MechanismStatus::New;
            self.exchange = None;
        }
    }

    fn upgradable(&self) -> Option<&dyn UpgradableMechanism> {
        Some(self)
    }
}

impl UpgradableMechanism for ScramMechanism {
    fn evaluate_upgrade(
        &self,
        parameters: &Element,
        ctx: &MechanismContext,
    ) -> Result<Element, XmppError> {
        let salt_element = parameters
            .get_child("salt", ns::SCRAM_UPGRADE)
            .ok_or_else(|| XmppError::with_message(ErrorCondition::BadRequest, "Missing salt"))?;
        let salt = BASE64_STANDARD
            .decode(salt_element.text().trim())
            .map_err(|_| XmppError::with_message(ErrorCondition::BadRequest, "Missing salt"))?;
        let iterations: u32 = salt_element
            .attr("iterations")
            .and_then(|i| i.parse().ok())
            .filter(|i| (1..=MAX_ITERATIONS).contains(i))
            .ok_or_else(|| {
                XmppError::with_message(ErrorCondition::BadRequest, "Missing iterations")
            })?;
        let password = ctx.credentials.get().password.ok_or_else(|| {
            XmppError::with_message(
                ErrorCondition::FeatureNotImplemented,
                "Cannot upgrade SCRAM - no password",
            )
        })?;

        let salted = self.hash.hi(password.as_bytes(), &salt, iterations);
        Ok(Element::builder("hash", ns::SCRAM_UPGRADE)
            .append(BASE64_STANDARD.encode(salted))
            .build())
    }
}

fn decode_challenge(input: Option<&str>) -> Result<String, MechanismError> {
    let input =
        input.ok_or_else(|| MechanismError::BadChallenge("Received empty challenge".to_string()))?;
    let bytes = BASE64_STANDARD
        .decode(input)
        .map_err(|_| MechanismError::BadChallenge("Failed to decode challenge".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| MechanismError::BadChallenge("Failed to decode challenge".to_string()))
}

fn random_nonce() -> String {
    let mut rng = rand::rng();
    (0..NONCE_LENGTH)
        .map(|_| NONCE_ALPHABET[rng.random_range(0..NONCE_ALPHABET.len())] as char)
        .collect()
}

/// Escape a SASL name per RFC 5802 (`=` to `=3D`, `,` to `=2C`).
pub fn encode_sasl_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, CredentialsStore};
    use crate::connector::transport::ChannelBindingType;
    use assert_matches::assert_matches;
    use jid::BareJid;

    fn context(password: &str) -> MechanismContext {
        MechanismContext::new(
            BareJid::new("user@example.com").unwrap(),
            CredentialsStore::new(Credentials::with_password(password)),
        )
    }

    fn b64(s: &str) -> String {
        BASE64_STANDARD.encode(s)
    }

    fn unb64(s: &str) -> String {
        String::from_utf8(BASE64_STANDARD.decode(s).unwrap()).unwrap()
    }

    #[test]
    fn rfc5802_sha1_exchange() {
        let ctx = context("pencil");
        let mut scram = ScramMechanism::new(HashAlgorithm::Sha1, false)
            .with_client_nonce("fyko+d2lbbFgONRv9qkxdawL");

        let first = scram.evaluate_challenge(None, &ctx).unwrap().unwrap();
        assert_eq!(unb64(&first), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
        assert_eq!(scram.status(), MechanismStatus::InProgress);

        let server_first =
            "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let last = scram
            .evaluate_challenge(Some(&b64(server_first)), &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(
            unb64(&last),
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );
        assert_eq!(scram.status(), MechanismStatus::CompletedExpected);

        let result = scram
            .evaluate_challenge(Some(&b64("v=rmF9pqV8S7suAoZWja4dJRkFsKQ=")), &ctx)
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(scram.status(), MechanismStatus::Completed);
        assert_eq!(scram.evaluate_challenge(None, &ctx).unwrap(), None);
        assert_matches!(
            scram.evaluate_challenge(Some("dj1h"), &ctx),
            Err(MechanismError::Generic(_))
        );
    }

    #[test]
    fn rfc7677_sha256_exchange() {
        let ctx = context("pencil");
        let mut scram = ScramMechanism::new(HashAlgorithm::Sha256, false)
            .with_client_nonce("rOprNGfwEbeRWgbNEkqO");

        let first = scram.evaluate_challenge(None, &ctx).unwrap().unwrap();
        assert_eq!(unb64(&first), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let server_first = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let last = scram
            .evaluate_challenge(Some(&b64(server_first)), &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(
            unb64(&last),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        scram
            .evaluate_challenge(
                Some(&b64("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")),
                &ctx,
            )
            .unwrap();
        assert_eq!(scram.status(), MechanismStatus::Completed);

        let cached = ctx.credentials.get().salted_password.unwrap();
        assert_eq!(
            cached.id,
            SaltedPassword::generate_id(
                "SCRAM-SHA-256",
                4096,
                &BASE64_STANDARD.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap()
            )
        );
    }

    #[test]
    fn cached_salted_password_replaces_password() {
        let ctx = context("pencil");
        let server_first =
            "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let mut scram = ScramMechanism::new(HashAlgorithm::Sha1, false)
            .with_client_nonce("fyko+d2lbbFgONRv9qkxdawL");
        scram.evaluate_challenge(None, &ctx).unwrap();
        scram.evaluate_challenge(Some(&b64(server_first)), &ctx).unwrap();

        ctx.credentials.update(|c| c.password = None);
        let mut again = ScramMechanism::new(HashAlgorithm::Sha1, false)
            .with_client_nonce("fyko+d2lbbFgONRv9qkxdawL");
        assert!(again.is_allowed_to_use(&ctx));
        again.evaluate_challenge(None, &ctx).unwrap();
        let last = again
            .evaluate_challenge(Some(&b64(server_first)), &ctx)
            .unwrap()
            .unwrap();
        assert!(unb64(&last).ends_with("p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="));
    }

    #[test]
    fn rejects_foreign_nonce() {
        let ctx = context("pencil");
        let mut scram =
            ScramMechanism::new(HashAlgorithm::Sha1, false).with_client_nonce("abcdef");
        scram.evaluate_challenge(None, &ctx).unwrap();
        assert_matches!(
            scram.evaluate_challenge(Some(&b64("r=zzzzzz123,s=QSXCR+Q6sek8bf92,i=4096")), &ctx),
            Err(MechanismError::WrongNonce)
        );
    }

    #[test]
    fn rejects_bad_server_first() {
        let ctx = context("pencil");
        for challenge in [
            "garbage",
            "r=abc,s=QSXCR+Q6sek8bf92,i=0",
            "r=abc,s=QSXCR+Q6sek8bf92,i=999999999",
        ] {
            let mut scram =
                ScramMechanism::new(HashAlgorithm::Sha1, false).with_client_nonce("abc");
            scram.evaluate_challenge(None, &ctx).unwrap();
            assert_matches!(
                scram.evaluate_challenge(Some(&b64(challenge)), &ctx),
                Err(MechanismError::BadChallenge(_)),
                "{challenge}"
            );
        }
    }

    #[test]
    fn bad_server_signature_clears_cache() {
        let ctx = context("pencil");
        let mut scram = ScramMechanism::new(HashAlgorithm::Sha1, false)
            .with_client_nonce("fyko+d2lbbFgONRv9qkxdawL");
        scram.evaluate_challenge(None, &ctx).unwrap();
        scram
            .evaluate_challenge(
                Some(&b64(
                    "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
                )),
                &ctx,
            )
            .unwrap();
        assert!(ctx.credentials.get().salted_password.is_some());
        assert_matches!(
            scram.evaluate_challenge(Some(&b64("v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=")), &ctx),
            Err(MechanismError::InvalidServerSignature)
        );
        assert!(ctx.credentials.get().salted_password.is_none());
    }

    #[test]
    fn server_error_in_final_message() {
        let ctx = context("pencil");
        let mut scram = ScramMechanism::new(HashAlgorithm::Sha1, false).with_client_nonce("abc");
        scram.evaluate_challenge(None, &ctx).unwrap();
        scram
            .evaluate_challenge(Some(&b64("r=abcdef,s=QSXCR+Q6sek8bf92,i=1")), &ctx)
            .unwrap();
        assert_matches!(
            scram.evaluate_challenge(Some(&b64("e=invalid-proof")), &ctx),
            Err(MechanismError::BadChallenge(message)) if message.contains("invalid-proof")
        );
    }

    #[test]
    fn plus_variant_binds_to_tls_exporter() {
        let mut ctx = context("pencil");
        ctx.tls_active = true;
        ctx.server_bindings = vec![ChannelBindingType::TlsServerEndPoint, ChannelBindingType::TlsExporter];
        ctx.channel_bindings.exporter = Some(vec![1, 2, 3]);

        let mut scram = ScramMechanism::new(HashAlgorithm::Sha256, true).with_client_nonce("abc");
        assert_eq!(scram.name(), "SCRAM-SHA-256-PLUS");
        let first = scram.evaluate_challenge(None, &ctx).unwrap().unwrap();
        assert_eq!(unb64(&first), "p=tls-exporter,,n=user,r=abc");

        let last = scram
            .evaluate_challenge(Some(&b64("r=abcdef,s=QSXCR+Q6sek8bf92,i=1")), &ctx)
            .unwrap()
            .unwrap();
        let mut expected = b"p=tls-exporter,,".to_vec();
        expected.extend([1, 2, 3]);
        assert!(unb64(&last).starts_with(&format!("c={},", BASE64_STANDARD.encode(expected))));
    }

    #[test]
    fn plus_variant_falls_back_without_binding_data() {
        let mut ctx = context("pencil");
        ctx.tls_active = true;
        ctx.server_bindings = vec![ChannelBindingType::TlsUnique];
        let mut scram = ScramMechanism::new(HashAlgorithm::Sha256, true).with_client_nonce("abc");
        assert!(scram.is_allowed_to_use(&ctx));
        let first = scram.evaluate_challenge(None, &ctx).unwrap().unwrap();
        assert_eq!(unb64(&first), "n,,n=user,r=abc");
    }

    #[test]
    fn escapes_username() {
        let ctx = MechanismContext::new(
            BareJid::new("a=b@example.com").unwrap(),
            CredentialsStore::new(Credentials::with_password("x")),
        );
        let mut scram = ScramMechanism::new(HashAlgorithm::Sha1, false).with_client_nonce("n");
        let first = scram.evaluate_challenge(None, &ctx).unwrap().unwrap();
        assert_eq!(unb64(&first), "n,,n=a=3Db,r=n");
        assert_eq!(encode_sasl_name("a,b"), "a=2Cb");
    }

    #[test]
    fn random_nonces_use_alphabet() {
        let nonce = random_nonce();
        assert_eq!(nonce.len(), NONCE_LENGTH);
        assert!(nonce.bytes().all(|b| NONCE_ALPHABET.contains(&b)));
        assert_ne!(nonce, random_nonce());
    }

    #[test]
    fn upgrade_hashes_password_with_given_salt() {
        let ctx = context("pencil");
        let scram = ScramMechanism::new(HashAlgorithm::Sha256, false);
        let parameters: Element = format!(
            "<task-data xmlns='{}'><salt xmlns='{}' iterations='4096'>W22ZaJ0SNY7soEsUEjb6gQ==</salt></task-data>",
            ns::SASL2,
            ns::SCRAM_UPGRADE
        )
        .parse()
        .unwrap();
        let hash = scram.upgradable().unwrap().evaluate_upgrade(&parameters, &ctx).unwrap();
        assert!(hash.is("hash", ns::SCRAM_UPGRADE));
        let expected = HashAlgorithm::Sha256.hi(
            b"pencil",
            &BASE64_STANDARD.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap(),
            4096,
        );
        assert_eq!(BASE64_STANDARD.decode(hash.text()).unwrap(), expected);

        let missing: Element = format!("<task-data xmlns='{}'/>", ns::SASL2).parse().unwrap();
        assert_eq!(
            scram.evaluate_upgrade(&missing, &ctx).unwrap_err().condition,
            ErrorCondition::BadRequest
        );

        let no_password = MechanismContext::new(
            BareJid::new("user@example.com").unwrap(),
            CredentialsStore::new(Credentials::default()),
        );
        assert_eq!(
            scram.evaluate_upgrade(&parameters, &no_password).unwrap_err().condition,
            ErrorCondition::FeatureNotImplemented
        );
    }
}
