//! Gateway configuration: the HTTP/WS-facing `ServerConfig` plus the
//! engine's own `EngineConfig`, both loaded from the environment the same
//! way `stream-worker`-based apps in this codebase read their tunables.

use core_config::{server::ServerConfig, Environment, FromEnv};
use dispatch_engine::EngineConfig;
use eyre::{Result, WrapErr};

#[derive(Clone)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_env();
        let server = ServerConfig::from_env().wrap_err("failed to load server configuration")?;
        let engine = EngineConfig::from_env().map_err(|e| eyre::eyre!(e)).wrap_err("failed to load engine configuration")?;

        Ok(Self {
            environment,
            server,
            engine,
        })
    }
}
