pub mod config;
pub mod connector;
pub mod context;
pub mod criteria;
pub mod error;
pub mod modules;
pub mod ns;
pub mod response;
pub mod sasl;
pub mod session;
pub mod stanza;

#[cfg(test)]
mod testing;

pub use config::{ConnectionConfiguration, ConnectorOptions, Credentials, CredentialsStore, FastToken};
pub use connector::dns::ServerEndpoint;
pub use connector::{Connector, ConnectorEvent, ConnectorState, DisconnectReason};
pub use context::{ClientDisconnectReason, ClientState, Context};
pub use criteria::Criteria;
pub use error::{AuthError, ConnectionError, ErrorCondition, SaslCause, SaslError, XmppError};
pub use modules::{ModuleIdentifier, ModuleManager, ResetScope, XmppModule};
pub use response::ResponseManager;
pub use session::SessionLogic;
pub use stanza::{Stanza, StanzaKind, StanzaType};
