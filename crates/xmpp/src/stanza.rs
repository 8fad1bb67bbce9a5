//! Typed view over top-level stream elements.
//!
//! A [`Stanza`] owns its `minidom::Element` and parses the addressing
//! attributes (`from`, `to`, `type`) once, on first access. Mutations made
//! through the setters on [`Stanza`] invalidate that cache; mutations made
//! through [`Stanza::element_mut`] do as well. Anything else that changes the
//! element behind the stanza's back is not observed.

use std::fmt;
use std::sync::OnceLock;

use jid::Jid;
use minidom::Element;

use crate::error::{ConnectionError, XmppError};
use crate::ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    /// Non-stanza top-level elements (SASL, stream management, features...).
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaType {
    Error,
    Get,
    Set,
    Result,
    Chat,
    Groupchat,
    Headline,
    Normal,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Unavailable,
    Available,
}

impl StanzaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaType::Error => "error",
            StanzaType::Get => "get",
            StanzaType::Set => "set",
            StanzaType::Result => "result",
            StanzaType::Chat => "chat",
            StanzaType::Groupchat => "groupchat",
            StanzaType::Headline => "headline",
            StanzaType::Normal => "normal",
            StanzaType::Subscribe => "subscribe",
            StanzaType::Subscribed => "subscribed",
            StanzaType::Unsubscribe => "unsubscribe",
            StanzaType::Unsubscribed => "unsubscribed",
            StanzaType::Probe => "probe",
            StanzaType::Unavailable => "unavailable",
            StanzaType::Available => "available",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "error" => StanzaType::Error,
            "get" => StanzaType::Get,
            "set" => StanzaType::Set,
            "result" => StanzaType::Result,
            "chat" => StanzaType::Chat,
            "groupchat" => StanzaType::Groupchat,
            "headline" => StanzaType::Headline,
            "normal" => StanzaType::Normal,
            "subscribe" => StanzaType::Subscribe,
            "subscribed" => StanzaType::Subscribed,
            "unsubscribe" => StanzaType::Unsubscribe,
            "unsubscribed" => StanzaType::Unsubscribed,
            "probe" => StanzaType::Probe,
            "unavailable" => StanzaType::Unavailable,
            "available" => StanzaType::Available,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Addressing {
    from: Option<Jid>,
    to: Option<Jid>,
    stanza_type: Option<StanzaType>,
}

#[derive(Debug, Clone)]
pub struct Stanza {
    element: Element,
    addressing: OnceLock<Addressing>,
}

impl Stanza {
    pub fn new(element: Element) -> Self {
        Self {
            element,
            addressing: OnceLock::new(),
        }
    }

    pub fn message() -> Self {
        Self::new(Element::builder("message", ns::JABBER_CLIENT).build())
    }

    pub fn presence() -> Self {
        Self::new(Element::builder("presence", ns::JABBER_CLIENT).build())
    }

    /// An iq of the given type carrying `payload` as its only child.
    pub fn iq(stanza_type: StanzaType, payload: Option<Element>) -> Self {
        let mut builder =
            Element::builder("iq", ns::JABBER_CLIENT).attr("type", stanza_type.as_str());
        if let Some(payload) = payload {
            builder = builder.append(payload);
        }
        Self::new(builder.build())
    }

    pub fn kind(&self) -> StanzaKind {
        if self.element.ns() != ns::JABBER_CLIENT {
            return StanzaKind::Other;
        }
        match self.element.name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            _ => StanzaKind::Other,
        }
    }

    pub fn name(&self) -> &str {
        self.element.name()
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn element_mut(&mut self) -> &mut Element {
        self.addressing = OnceLock::new();
        &mut self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.element.set_attr("id", id.into());
    }

    fn addressing(&self) -> &Addressing {
        self.addressing.get_or_init(|| Addressing {
            from: self.element.attr("from").and_then(|v| Jid::new(v).ok()),
            to: self.element.attr("to").and_then(|v| Jid::new(v).ok()),
            stanza_type: self.element.attr("type").and_then(StanzaType::from_name),
        })
    }

    pub fn from(&self) -> Option<&Jid> {
        self.addressing().from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.addressing().to.as_ref()
    }

    pub fn stanza_type(&self) -> Option<StanzaType> {
        self.addressing().stanza_type
    }

    pub fn set_from(&mut self, from: Option<&Jid>) {
        replace_attr(&mut self.element, "from", from.map(|jid| jid.to_string()));
        self.addressing = OnceLock::new();
    }

    pub fn set_to(&mut self, to: Option<&Jid>) {
        replace_attr(&mut self.element, "to", to.map(|jid| jid.to_string()));
        self.addressing = OnceLock::new();
    }

    pub fn set_type(&mut self, stanza_type: Option<StanzaType>) {
        replace_attr(
            &mut self.element,
            "type",
            stanza_type.map(|t| t.as_str().to_string()),
        );
        self.addressing = OnceLock::new();
    }

    /// True for iq get/set, the stanzas a peer is obliged to answer.
    pub fn is_request(&self) -> bool {
        self.kind() == StanzaKind::Iq
            && matches!(self.stanza_type(), Some(StanzaType::Get | StanzaType::Set))
    }

    /// Build the `error` reply for this stanza. Returns `None` for stanzas
    /// that must never be answered with an error (errors and iq results).
    pub fn error_result(&self, error: &XmppError) -> Option<Stanza> {
        if self.kind() == StanzaKind::Other {
            return None;
        }
        if matches!(
            self.stanza_type(),
            Some(StanzaType::Error | StanzaType::Result)
        ) {
            return None;
        }

        let mut builder = Element::builder(self.element.name(), self.element.ns())
            .attr("type", StanzaType::Error.as_str());
        for (name, value) in self.element.attrs() {
            match name {
                "from" => builder = builder.attr("to", value),
                "to" => builder = builder.attr("from", value),
                "type" => {}
                _ => builder = builder.attr(name, value),
            }
        }
        let element = builder
            .append_all(self.element.nodes().cloned())
            .append(error.to_element())
            .build();
        Some(Stanza::new(element))
    }

    /// An empty iq result answering this request.
    pub fn result_reply(&self) -> Stanza {
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", StanzaType::Result.as_str());
        if let Some(id) = self.id() {
            builder = builder.attr("id", id);
        }
        if let Some(from) = self.element.attr("from") {
            builder = builder.attr("to", from);
        }
        if let Some(to) = self.element.attr("to") {
            builder = builder.attr("from", to);
        }
        Stanza::new(builder.build())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConnectionError> {
        let mut payload = Vec::new();
        self.element.write_to(&mut payload).map_err(|error| {
            ConnectionError::XmlError(format!("failed to serialize <{}/>: {error}", self.name()))
        })?;
        Ok(payload)
    }
}

/// Set or drop an attribute. minidom cannot remove an existing attribute in
/// place, so removal rebuilds the element without it.
fn replace_attr(element: &mut Element, name: &str, value: Option<String>) {
    match value {
        Some(value) => element.set_attr(name, value),
        None if element.attr(name).is_some() => {
            let mut builder = Element::builder(element.name(), element.ns());
            for (attr, existing) in element.attrs() {
                if attr != name {
                    builder = builder.attr(attr, existing);
                }
            }
            *element = builder.append_all(element.nodes().cloned()).build();
        }
        None => {}
    }
}

impl From<Element> for Stanza {
    fn from(element: Element) -> Self {
        Stanza::new(element)
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => f.write_str(&String::from_utf8_lossy(&bytes)),
            Err(_) => write!(f, "<{}/>", self.name()),
        }
    }
}
