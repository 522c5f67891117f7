//! Configuration management for the abuse prevention engine.
//!
//! Configuration layers a TOML file under environment variables; every key
//! has a programmatic default so the engine starts with no file at all.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("redis.pool_size", 10)?
        .set_default("redis.op_timeout_ms", 250)?
        .build()?;

    config.try_deserialize()
}
