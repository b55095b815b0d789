use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
///
/// Process-level settings only. Runtime flags (pause switches, concurrency
/// caps, secrets under rotation) live in the database-backed settings store.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base URL of the vendor API, e.g. `https://acme.retail.example.com`.
    pub vendor_base_url: String,
    /// Tenant-scoped OAuth token endpoint. Defaults to
    /// `{vendor_base_url}/api/1.0/token` when unset.
    pub vendor_token_url: String,
    pub vendor_client_id: String,
    pub vendor_client_secret: String,
    /// OAuth redirect URI sent with authorization-code exchanges.
    pub vendor_redirect_uri: Option<String>,
    pub http_timeout_seconds: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let vendor_base_url = env::var("VENDOR_BASE_URL")
            .context("VENDOR_BASE_URL must be set")?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            vendor_token_url: env::var("VENDOR_TOKEN_URL")
                .unwrap_or_else(|_| format!("{}/api/1.0/token", vendor_base_url)),
            vendor_base_url,
            vendor_client_id: env::var("VENDOR_CLIENT_ID").unwrap_or_default(),
            vendor_client_secret: env::var("VENDOR_CLIENT_SECRET").unwrap_or_default(),
            vendor_redirect_uri: env::var("VENDOR_REDIRECT_URI").ok(),
            http_timeout_seconds: env::var("HTTP_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("HTTP_TIMEOUT_SECONDS must be a valid number")?,
        })
    }
}
