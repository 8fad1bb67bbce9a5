use std::fmt;

use minidom::Element;
use thiserror::Error;

use crate::ns;

/// Defined stanza error conditions (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

const CONDITIONS: &[(ErrorCondition, &str, &str)] = &[
    (ErrorCondition::BadRequest, "bad-request", "modify"),
    (ErrorCondition::Conflict, "conflict", "cancel"),
    (ErrorCondition::FeatureNotImplemented, "feature-not-implemented", "cancel"),
    (ErrorCondition::Forbidden, "forbidden", "auth"),
    (ErrorCondition::Gone, "gone", "cancel"),
    (ErrorCondition::InternalServerError, "internal-server-error", "cancel"),
    (ErrorCondition::ItemNotFound, "item-not-found", "cancel"),
    (ErrorCondition::JidMalformed, "jid-malformed", "modify"),
    (ErrorCondition::NotAcceptable, "not-acceptable", "modify"),
    (ErrorCondition::NotAllowed, "not-allowed", "cancel"),
    (ErrorCondition::NotAuthorized, "not-authorized", "auth"),
    (ErrorCondition::PolicyViolation, "policy-violation", "modify"),
    (ErrorCondition::RecipientUnavailable, "recipient-unavailable", "wait"),
    (ErrorCondition::Redirect, "redirect", "modify"),
    (ErrorCondition::RegistrationRequired, "registration-required", "auth"),
    (ErrorCondition::RemoteServerNotFound, "remote-server-not-found", "cancel"),
    (ErrorCondition::RemoteServerTimeout, "remote-server-timeout", "wait"),
    (ErrorCondition::ResourceConstraint, "resource-constraint", "wait"),
    (ErrorCondition::ServiceUnavailable, "service-unavailable", "cancel"),
    (ErrorCondition::SubscriptionRequired, "subscription-required", "auth"),
    (ErrorCondition::UndefinedCondition, "undefined-condition", "cancel"),
    (ErrorCondition::UnexpectedRequest, "unexpected-request", "wait"),
];

impl ErrorCondition {
    fn entry(&self) -> &'static (ErrorCondition, &'static str, &'static str) {
        CONDITIONS
            .iter()
            .find(|(condition, _, _)| condition == self)
            .unwrap_or(&CONDITIONS[20])
    }

    /// Element name of the condition.
    pub fn as_str(&self) -> &'static str {
        self.entry().1
    }

    /// Default value of the `type` attribute of the enclosing `<error/>`.
    pub fn error_type(&self) -> &'static str {
        self.entry().2
    }

    pub fn from_name(name: &str) -> Option<Self> {
        CONDITIONS
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(condition, _, _)| *condition)
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stanza-level failure, either received from the peer or raised locally
/// while processing or sending a stanza.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition}{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct XmppError {
    pub condition: ErrorCondition,
    pub message: Option<String>,
}

impl XmppError {
    pub fn new(condition: ErrorCondition) -> Self {
        Self {
            condition,
            message: None,
        }
    }

    pub fn with_message(condition: ErrorCondition, message: impl Into<String>) -> Self {
        Self {
            condition,
            message: Some(message.into()),
        }
    }

    pub fn undefined_condition() -> Self {
        Self::new(ErrorCondition::UndefinedCondition)
    }

    /// Extract the error carried by an `error`-typed stanza element.
    pub fn from_error_element(element: &Element) -> Self {
        let Some(error) = element.children().find(|child| child.name() == "error") else {
            return Self::undefined_condition();
        };

        let condition = error
            .children()
            .filter(|child| child.ns() == ns::STANZAS && child.name() != "text")
            .find_map(|child| ErrorCondition::from_name(child.name()))
            .unwrap_or(ErrorCondition::UndefinedCondition);
        let message = error
            .get_child("text", ns::STANZAS)
            .map(|text| text.text())
            .filter(|text| !text.is_empty());

        Self { condition, message }
    }

    /// Build the `<error/>` child describing this failure.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", self.condition.error_type())
            .append(Element::builder(self.condition.as_str(), ns::STANZAS).build());
        if let Some(message) = &self.message {
            builder = builder.append(
                Element::builder("text", ns::STANZAS)
                    .append(message.as_str())
                    .build(),
            );
        }
        builder.build()
    }
}

/// SASL failure conditions (RFC 6120 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslCause {
    Aborted,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MechanismTooWeak,
    NotAuthorized,
    ServerNotTrusted,
    TemporaryAuthFailure,
}

impl SaslCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslCause::Aborted => "aborted",
            SaslCause::IncorrectEncoding => "incorrect-encoding",
            SaslCause::InvalidAuthzid => "invalid-authzid",
            SaslCause::InvalidMechanism => "invalid-mechanism",
            SaslCause::MechanismTooWeak => "mechanism-too-weak",
            SaslCause::NotAuthorized => "not-authorized",
            SaslCause::ServerNotTrusted => "server-not-trusted",
            SaslCause::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "aborted" => SaslCause::Aborted,
            "incorrect-encoding" => SaslCause::IncorrectEncoding,
            "invalid-authzid" => SaslCause::InvalidAuthzid,
            "invalid-mechanism" => SaslCause::InvalidMechanism,
            "mechanism-too-weak" => SaslCause::MechanismTooWeak,
            "not-authorized" => SaslCause::NotAuthorized,
            "server-not-trusted" => SaslCause::ServerNotTrusted,
            "temporary-auth-failure" => SaslCause::TemporaryAuthFailure,
            _ => return None,
        })
    }
}

impl fmt::Display for SaslCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SASL {cause}{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct SaslError {
    pub cause: SaslCause,
    pub message: Option<String>,
}

impl SaslError {
    pub fn new(cause: SaslCause, message: Option<String>) -> Self {
        Self { cause, message }
    }

    /// Parse a `<failure/>` element from either the SASL or SASL2 namespace.
    pub fn from_failure(failure: &Element) -> Self {
        let cause = failure
            .children()
            .find_map(|child| SaslCause::from_name(child.name()))
            .unwrap_or(SaslCause::NotAuthorized);
        let message = failure
            .children()
            .find(|child| child.name() == "text")
            .map(|text| text.text())
            .filter(|text| !text.is_empty());
        Self { cause, message }
    }
}

/// Raised by a SASL mechanism while evaluating a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MechanismError {
    #[error("bad challenge: {0}")]
    BadChallenge(String),

    #[error("server nonce does not extend the client nonce")]
    WrongNonce,

    #[error("invalid server signature")]
    InvalidServerSignature,

    #[error("mechanism error: {0}")]
    Generic(String),

    #[error(transparent)]
    Sasl(#[from] SaslError),

    #[error(transparent)]
    Xmpp(#[from] XmppError),
}

/// Outcome of a failed login.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error(transparent)]
    Sasl(#[from] SaslError),

    #[error(transparent)]
    Xmpp(#[from] XmppError),
}

impl AuthError {
    pub fn sasl_cause(&self) -> Option<SaslCause> {
        match self {
            AuthError::Sasl(error) => Some(error.cause),
            AuthError::Xmpp(_) => None,
        }
    }
}

impl From<MechanismError> for AuthError {
    fn from(error: MechanismError) -> Self {
        match error {
            MechanismError::BadChallenge(message) | MechanismError::Generic(message) => {
                AuthError::Sasl(SaslError::new(
                    SaslCause::TemporaryAuthFailure,
                    Some(message),
                ))
            }
            MechanismError::WrongNonce => AuthError::Sasl(SaslError::new(
                SaslCause::ServerNotTrusted,
                Some("Wrong nonce".to_string()),
            )),
            MechanismError::InvalidServerSignature => AuthError::Sasl(SaslError::new(
                SaslCause::ServerNotTrusted,
                Some("Invalid server signature".to_string()),
            )),
            MechanismError::Sasl(error) => AuthError::Sasl(error),
            MechanismError::Xmpp(error) => AuthError::Xmpp(error),
        }
    }
}

/// Transport-level failures of a single connection attempt.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("server certificate rejected: {0}")]
    TlsCertificate(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("no route to server")]
    NoRoute,

    #[error("transport error: {0}")]
    TransportError(#[from] std::io::Error),

    #[error("XML error: {0}")]
    XmlError(String),
}

impl From<ConnectionError> for XmppError {
    fn from(error: ConnectionError) -> Self {
        let condition = match error {
            ConnectionError::Timeout => ErrorCondition::RemoteServerTimeout,
            ConnectionError::XmlError(_) => ErrorCondition::NotAcceptable,
            _ => ErrorCondition::ServiceUnavailable,
        };
        XmppError::with_message(condition, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_names_round_trip() {
        for (condition, name, _) in CONDITIONS {
            assert_eq!(ErrorCondition::from_name(name), Some(*condition));
            assert_eq!(condition.as_str(), *name);
        }
        assert_eq!(ErrorCondition::from_name("nonsense"), None);
    }

    #[test]
    fn error_element_carries_type_and_text() {
        let error = XmppError::with_message(ErrorCondition::FeatureNotImplemented, "nope");
        let element = error.to_element();
        assert_eq!(element.attr("type"), Some("cancel"));
        assert!(
            element
                .get_child("feature-not-implemented", ns::STANZAS)
                .is_some()
        );
        assert_eq!(
            element.get_child("text", ns::STANZAS).map(|t| t.text()),
            Some("nope".to_string())
        );
    }

    #[test]
    fn parses_error_from_stanza() {
        let stanza: Element = "<iq xmlns='jabber:client' type='error' id='1'><error type='wait'><remote-server-timeout xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>slow</text></error></iq>"
            .parse()
            .unwrap();
        let error = XmppError::from_error_element(&stanza);
        assert_eq!(error.condition, ErrorCondition::RemoteServerTimeout);
        assert_eq!(error.message.as_deref(), Some("slow"));
        assert_eq!(error.to_string(), "remote-server-timeout: slow");
    }

    #[test]
    fn parses_sasl_failure() {
        let failure: Element = "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text>bad password</text></failure>"
            .parse()
            .unwrap();
        let error = SaslError::from_failure(&failure);
        assert_eq!(error.cause, SaslCause::NotAuthorized);
        assert_eq!(error.message.as_deref(), Some("bad password"));
    }

    #[test]
    fn connection_errors_become_stanza_errors() {
        let error = XmppError::from(ConnectionError::Timeout);
        assert_eq!(error.condition, ErrorCondition::RemoteServerTimeout);
        let error = XmppError::from(ConnectionError::NoRoute);
        assert_eq!(error.condition, ErrorCondition::ServiceUnavailable);
        assert_eq!(error.message.as_deref(), Some("no route to server"));
    }

    #[test]
    fn mechanism_errors_map_to_sasl_causes() {
        assert_eq!(
            AuthError::from(MechanismError::WrongNonce),
            AuthError::Sasl(SaslError::new(
                SaslCause::ServerNotTrusted,
                Some("Wrong nonce".to_string())
            ))
        );
        assert_eq!(
            AuthError::from(MechanismError::InvalidServerSignature).sasl_cause(),
            Some(SaslCause::ServerNotTrusted)
        );
        assert_eq!(
            AuthError::from(MechanismError::BadChallenge("x".into())).sasl_cause(),
            Some(SaslCause::TemporaryAuthFailure)
        );
        assert_eq!(
            AuthError::from(MechanismError::Generic("x".into())).sasl_cause(),
            Some(SaslCause::TemporaryAuthFailure)
        );
    }
}
