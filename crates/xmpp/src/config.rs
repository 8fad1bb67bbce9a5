//! Runtime connection configuration and account credentials.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jid::BareJid;
use sha2::{Digest, Sha256};
use skua_core::config::{Config, ConfigError};
use tokio::sync::watch;

use crate::connector::dns::{ServerEndpoint, ServerResolver};

/// Default preference order of SASL mechanisms. FAST variants only apply once
/// a token has been issued, so they go first.
pub const DEFAULT_SASL_MECHANISMS: &[&str] = &[
    "HT-SHA-256-EXPR",
    "HT-SHA-256-ENDP",
    "HT-SHA-256-NONE",
    "SCRAM-SHA-256-PLUS",
    "SCRAM-SHA-256",
    "SCRAM-SHA-1-PLUS",
    "SCRAM-SHA-1",
    "PLAIN",
    "ANONYMOUS",
];

/// Minimum lifetime left on a FAST token for it to be offered.
pub const FAST_TOKEN_MIN_VALIDITY: Duration = Duration::from_secs(10);

/// A cached `SaltedPassword` for one (mechanism, iterations, salt) triple.
#[derive(Clone, PartialEq, Eq)]
pub struct SaltedPassword {
    pub id: String,
    pub value: Vec<u8>,
}

impl SaltedPassword {
    pub fn generate_id(mechanism: &str, iterations: u32, salt: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(mechanism.as_bytes());
        hasher.update(iterations.to_string().as_bytes());
        hasher.update(salt);
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for SaltedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaltedPassword")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A FAST token issued by the server for one mechanism.
#[derive(Clone, PartialEq, Eq)]
pub struct FastToken {
    pub mechanism: String,
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl FastToken {
    /// True when the token belongs to `mechanism` and has more than
    /// [`FAST_TOKEN_MIN_VALIDITY`] left.
    pub fn is_usable_for(&self, mechanism: &str, now: DateTime<Utc>) -> bool {
        if self.mechanism != mechanism {
            return false;
        }
        let remaining = self.expires_at - now;
        remaining.to_std().is_ok_and(|left| left > FAST_TOKEN_MIN_VALIDITY)
    }
}

impl fmt::Debug for FastToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastToken")
            .field("mechanism", &self.mechanism)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub authentication_name: Option<String>,
    pub password: Option<String>,
    pub salted_password: Option<SaltedPassword>,
    pub fast_token: Option<FastToken>,
}

impl Credentials {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// Nothing configured at all; only ANONYMOUS may be used.
    pub fn is_empty(&self) -> bool {
        self.authentication_name.is_none()
            && self.password.is_none()
            && self.salted_password.is_none()
            && self.fast_token.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("authentication_name", &self.authentication_name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("salted_password", &self.salted_password)
            .field("fast_token", &self.fast_token)
            .finish()
    }
}

/// Shared, single-writer credentials cell.
///
/// Readers take a snapshot; mechanisms write through [`CredentialsStore::update`],
/// which publishes the change to every subscriber.
#[derive(Clone)]
pub struct CredentialsStore {
    sender: Arc<watch::Sender<Credentials>>,
}

impl CredentialsStore {
    pub fn new(credentials: Credentials) -> Self {
        let (sender, _) = watch::channel(credentials);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn get(&self) -> Credentials {
        self.sender.borrow().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Credentials)) {
        self.sender.send_modify(f);
    }

    pub fn subscribe(&self) -> watch::Receiver<Credentials> {
        self.sender.subscribe()
    }
}

impl fmt::Debug for CredentialsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.sender.borrow().fmt(f)
    }
}

/// Transport options consumed by the connector.
#[derive(Clone)]
pub struct ConnectorOptions {
    /// Fixed server to connect to instead of resolving the account domain.
    pub server: Option<ServerEndpoint>,
    pub direct_tls: bool,
    pub tcp_nodelay: bool,
    pub connect_timeout: Duration,
    /// Upper bound on the graceful `</stream:stream>` exchange in `stop`.
    pub stop_timeout: Duration,
    /// Replaces the platform trust store, e.g. for pinned or test roots.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub resolver: Option<Arc<dyn ServerResolver>>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            server: None,
            direct_tls: true,
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            tls_config: None,
            resolver: None,
        }
    }
}

impl fmt::Debug for ConnectorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorOptions")
            .field("server", &self.server)
            .field("direct_tls", &self.direct_tls)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("connect_timeout", &self.connect_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .field("tls_config", &self.tls_config.as_ref().map(|_| "custom"))
            .field("resolver", &self.resolver.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Client identification sent with SASL2 `<authenticate/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgent {
    pub id: Option<String>,
    pub software: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    pub user_jid: BareJid,
    pub resource: Option<String>,
    pub nickname: Option<String>,
    pub credentials: CredentialsStore,
    /// Acceptable mechanisms in preference order.
    pub sasl_mechanisms: Vec<String>,
    pub disable_tls: bool,
    pub disable_compression: bool,
    pub use_see_other_host: bool,
    pub connector: ConnectorOptions,
    pub user_agent: UserAgent,
}

impl ConnectionConfiguration {
    pub fn new(user_jid: BareJid, credentials: Credentials) -> Self {
        Self {
            user_jid,
            resource: None,
            nickname: None,
            credentials: CredentialsStore::new(credentials),
            sasl_mechanisms: DEFAULT_SASL_MECHANISMS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            disable_tls: false,
            disable_compression: true,
            use_see_other_host: true,
            connector: ConnectorOptions::default(),
            user_agent: UserAgent::default(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let user_jid = BareJid::new(&config.account.jid).map_err(|e| ConfigError::InvalidValue {
            field: "account.jid".to_string(),
            message: e.to_string(),
        })?;

        let credentials = Credentials {
            authentication_name: config.account.authentication_name.clone(),
            password: config.account.password.clone(),
            ..Credentials::default()
        };

        let mut configuration = Self::new(user_jid, credentials);
        configuration.resource = config.account.resource.clone();
        configuration.nickname = config.account.nickname.clone();
        configuration.disable_tls = config.connection.disable_tls;
        configuration.disable_compression = config.connection.disable_compression;
        configuration.use_see_other_host = config.connection.use_see_other_host;
        if !config.connection.sasl_mechanisms.is_empty() {
            configuration.sasl_mechanisms = config.connection.sasl_mechanisms.clone();
        }

        let connection = &config.connection;
        let direct_tls = connection.direct_tls && !connection.disable_tls;
        configuration.connector.direct_tls = direct_tls;
        configuration.connector.tcp_nodelay = connection.tcp_nodelay;
        configuration.connector.connect_timeout =
            Duration::from_secs(connection.connect_timeout_secs);
        configuration.connector.server = config.account.server.as_ref().map(|host| {
            let default_port = if direct_tls {
                crate::connector::dns::DEFAULT_DIRECT_TLS_PORT
            } else {
                crate::connector::dns::DEFAULT_CLIENT_PORT
            };
            ServerEndpoint::new(
                host.clone(),
                config.account.port.unwrap_or(default_port),
                direct_tls,
            )
        });

        configuration.user_agent.software = Some("skua".to_string());
        configuration.user_agent.device = configuration.resource.clone();

        Ok(configuration)
    }

    /// Load a TOML file through `skua_core` and build the runtime configuration.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let config = skua_core::load_config_from(path)?;
        Self::from_config(&config)
    }

    pub fn domain(&self) -> &str {
        self.user_jid.domain().as_str()
    }
}
