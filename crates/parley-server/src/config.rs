use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin; any origin when unset.
    pub client_origin: Option<String>,
}

impl Config {
    /// Read `PARLEY_*` variables, falling back to development defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = get("PARLEY_JWT_SECRET").unwrap_or_else(|| {
            warn!("PARLEY_JWT_SECRET not set, using the development secret");
            DEV_SECRET.into()
        });
        let port = match get("PARLEY_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("PARLEY_PORT is not a port number: {}", raw))?,
            None => 3000,
        };

        Ok(Self {
            jwt_secret,
            db_path: get("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()).into(),
            host: get("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            client_origin: get("PARLEY_CLIENT_ORIGIN").filter(|o| !o.is_empty()),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}
