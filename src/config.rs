//! Process configuration, loaded from the environment.
//!
//! Follows the teacher's `Config::from_env()` byte-for-byte in style
//! (`dotenvy::dotenv()` + `std::env::var` + `anyhow::Context` for required
//! variables, `.ok()`/a default for optional ones), adapted to this crate's
//! own settings: database DSN, bind port, provider base URL/credentials, and
//! the backoff/timeout knobs the poller and orchestrator need.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub provider_base_url: String,
    pub provider_api_key: String,
    pub provider_secret: String,

    pub poll_min_interval_ms: i64,
    pub poll_max_interval_ms: i64,
    pub poll_jitter: f64,
    pub poll_batch_size: i64,

    pub t2i_timeout_s: i64,
    pub t2v_timeout_s: i64,
    pub i2v_timeout_s: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,

            provider_base_url: env::var("PROVIDER_BASE_URL")
                .context("PROVIDER_BASE_URL must be set")?,
            provider_api_key: env::var("PROVIDER_API_KEY")
                .context("PROVIDER_API_KEY must be set")?,
            provider_secret: env::var("PROVIDER_SECRET")
                .context("PROVIDER_SECRET must be set")?,

            poll_min_interval_ms: env::var("POLL_MIN_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("POLL_MIN_INTERVAL_MS must be a valid number")?,
            poll_max_interval_ms: env::var("POLL_MAX_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("POLL_MAX_INTERVAL_MS must be a valid number")?,
            poll_jitter: env::var("POLL_JITTER")
                .unwrap_or_else(|_| "0.2".to_string())
                .parse()
                .context("POLL_JITTER must be a valid number")?,
            poll_batch_size: env::var("POLL_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("POLL_BATCH_SIZE must be a valid number")?,

            t2i_timeout_s: env::var("T2I_TIMEOUT_S")
                .unwrap_or_else(|_| "180".to_string())
                .parse()
                .context("T2I_TIMEOUT_S must be a valid number")?,
            t2v_timeout_s: env::var("T2V_TIMEOUT_S")
                .unwrap_or_else(|_| "1200".to_string())
                .parse()
                .context("T2V_TIMEOUT_S must be a valid number")?,
            i2v_timeout_s: env::var("I2V_TIMEOUT_S")
                .unwrap_or_else(|_| "1200".to_string())
                .parse()
                .context("I2V_TIMEOUT_S must be a valid number")?,
        })
    }
}
