use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Process-level settings common to every service binary. Service-specific
/// settings layer on top in each crate's own config module.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Config {
    /// Read `configuration.*` if present, then `APP__`-prefixed environment
    /// variables (`APP__PORT`). Environment wins.
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
