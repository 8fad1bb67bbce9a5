//! XML namespaces used on the client stream.

pub const JABBER_CLIENT: &str = "jabber:client";
pub const STREAM: &str = "http://etherx.jabber.org/streams";
pub const STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
pub const COMPRESS: &str = "http://jabber.org/protocol/compress";

pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const SASL2: &str = "urn:xmpp:sasl:2";
pub const SASL_CB: &str = "urn:xmpp:sasl-cb:0";
pub const FAST: &str = "urn:xmpp:fast:0";
pub const SCRAM_UPGRADE: &str = "urn:xmpp:scram-upgrade:0";

pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const BIND2: &str = "urn:xmpp:bind:0";
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const SM: &str = "urn:xmpp:sm:3";
pub const PING: &str = "urn:xmpp:ping";
pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
pub const SASL_UPGRADE: &str = "urn:xmpp:sasl:upgrade:0";
