//! Configuration module
//!
//! Engine settings come from `KILN_*` environment variables; the backend
//! address flag overrides the environment.

use anyhow::{Context, Result};
use tracing::debug;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: kiln_engine::Config,
}

impl Config {
    pub fn load(backend_addr: String) -> Result<Self> {
        let mut engine = kiln_engine::Config::from_env().context("Invalid KILN_* environment")?;
        engine.backend_addr = backend_addr;
        engine.validate()?;

        debug!(?engine, "Loaded configuration");
        Ok(Self { engine })
    }
}
