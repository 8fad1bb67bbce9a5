use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub jid: String,
    pub password: Option<String>,
    pub authentication_name: Option<String>,
    pub resource: Option<String>,
    pub nickname: Option<String>,
    pub server: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub disable_tls: bool,
    #[serde(default = "default_true")]
    pub disable_compression: bool,
    #[serde(default = "default_true")]
    pub use_see_other_host: bool,
    #[serde(default = "default_true")]
    pub direct_tls: bool,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Preference-ordered SASL mechanism names; empty means the built-in order.
    #[serde(default)]
    pub sasl_mechanisms: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            disable_tls: false,
            disable_compression: true,
            use_see_other_host: true,
            direct_tls: true,
            tcp_nodelay: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            sasl_mechanisms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    jid: Option<String>,
    password: Option<String>,
    server: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Mechanism names the client knows how to drive.
pub const KNOWN_SASL_MECHANISMS: &[&str] = &[
    "HT-SHA-256-EXPR",
    "HT-SHA-256-UNIQ",
    "HT-SHA-256-ENDP",
    "HT-SHA-256-NONE",
    "SCRAM-SHA-256-PLUS",
    "SCRAM-SHA-256",
    "SCRAM-SHA-1-PLUS",
    "SCRAM-SHA-1",
    "PLAIN",
    "ANONYMOUS",
];

/// Load configuration from a specific path, merging environment variable overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path.as_ref(), config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        jid: std::env::var("SKUA_JID").ok(),
        password: std::env::var("SKUA_PASSWORD").ok(),
        server: std::env::var("SKUA_SERVER").ok(),
        log_level: std::env::var("SKUA_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(jid) = overrides.jid {
        config.account.jid = jid;
    }
    if let Some(password) = overrides.password {
        config.account.password = Some(password);
    }
    if let Some(server) = overrides.server {
        config.account.server = Some(server);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.account.jid.is_empty() {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["account.jid".to_string()],
        });
    }

    let domain = config
        .account
        .jid
        .rsplit_once('@')
        .map_or(config.account.jid.as_str(), |(_, domain)| domain);
    if domain.is_empty() || domain.contains('/') {
        return Err(ConfigError::InvalidValue {
            field: "account.jid".to_string(),
            message: "must be a bare JID with a domain part".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.connection.connect_timeout_secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "connection.connect_timeout_secs".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if let Some(unknown) = config
        .connection
        .sasl_mechanisms
        .iter()
        .find(|name| !KNOWN_SASL_MECHANISMS.contains(&name.as_str()))
    {
        return Err(ConfigError::InvalidValue {
            field: "connection.sasl_mechanisms".to_string(),
            message: format!("unknown mechanism {unknown}"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    fn minimal_toml() -> &'static str {
        r#"
[account]
jid = "user@example.com"
password = "secret"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_without_env(minimal_toml()).unwrap();
        assert_eq!(config.account.jid, "user@example.com");
        assert_eq!(config.account.password.as_deref(), Some("secret"));
        assert!(config.account.resource.is_none());
        assert!(!config.connection.disable_tls);
        assert!(config.connection.disable_compression);
        assert!(config.connection.use_see_other_host);
        assert!(config.connection.direct_tls);
        assert!(config.connection.tcp_nodelay);
        assert_eq!(config.connection.connect_timeout_secs, 30);
        assert!(config.connection.sasl_mechanisms.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_connection_section() {
        let toml = r#"
[account]
jid = "user@example.com"
server = "xmpp.example.com"
port = 5223

[connection]
disable_tls = true
disable_compression = false
direct_tls = false
connect_timeout_secs = 5
sasl_mechanisms = ["SCRAM-SHA-256", "PLAIN"]
"#;
        let config = parse_without_env(toml).unwrap();
        assert!(config.account.password.is_none());
        assert_eq!(config.account.server.as_deref(), Some("xmpp.example.com"));
        assert_eq!(config.account.port, Some(5223));
        assert!(config.connection.disable_tls);
        assert!(!config.connection.disable_compression);
        assert!(!config.connection.direct_tls);
        assert_eq!(config.connection.connect_timeout_secs, 5);
        assert_eq!(
            config.connection.sasl_mechanisms,
            vec!["SCRAM-SHA-256".to_string(), "PLAIN".to_string()]
        );
    }

    #[test]
    fn rejects_missing_jid() {
        let toml = r#"
[account]
jid = ""
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::MissingRequiredFields { fields } if fields == vec!["account.jid".to_string()]);
    }

    #[test]
    fn rejects_jid_without_domain() {
        let toml = r#"
[account]
jid = "user@"
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "account.jid");
    }

    #[test]
    fn rejects_invalid_log_level() {
        let toml = r#"
[account]
jid = "user@example.com"

[logging]
level = "verbose"
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "logging.level");
    }

    #[test]
    fn rejects_unknown_sasl_mechanism() {
        let toml = r#"
[account]
jid = "user@example.com"

[connection]
sasl_mechanisms = ["DIGEST-MD5"]
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidValue { field, message } => {
                assert_eq!(field, "connection.sasl_mechanisms");
                assert!(message.contains("DIGEST-MD5"));
            }
            other => panic!("expected InvalidValue, got: {other}"),
        }
    }

    #[test]
    fn rejects_zero_connect_timeout() {
        let toml = r#"
[account]
jid = "user@example.com"

[connection]
connect_timeout_secs = 0
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "connection.connect_timeout_secs");
    }

    #[test]
    fn reports_toml_error_position() {
        let toml = "[account]\njid = \"user@example.com\"\nport = \"x\"\n";
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidToml { line, .. } => assert_eq!(line, 3),
            other => panic!("expected InvalidToml, got: {other}"),
        }
    }

    #[test]
    fn overrides_replace_file_values() {
        let overrides = ConfigOverrides {
            jid: Some("other@example.org".to_string()),
            password: Some("override".to_string()),
            server: Some("relay.example.org".to_string()),
            log_level: Some("debug".to_string()),
        };
        let config = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap();
        assert_eq!(config.account.jid, "other@example.org");
        assert_eq!(config.account.password.as_deref(), Some("override"));
        assert_eq!(config.account.server.as_deref(), Some("relay.example.org"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn loads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();

        let config =
            load_config_from_with_overrides(file.path(), ConfigOverrides::default()).unwrap();
        assert_eq!(config.account.jid, "user@example.com");
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let err = load_config_from_with_overrides(&path, ConfigOverrides::default()).unwrap_err();
        assert_matches!(err, ConfigError::FileNotFound { path: p } if p == path);
    }
}
