pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, ConfigError, load_config_from, load_config_from_str};
pub use error::{Result, SkuaError};
