//! Application configuration loaded from environment variables.
//!
//! Required: `REGISTRY_URL`
//! Optional: `REGISTRY_AUTH`, `HTTP_PORT`, `SPIN_MS_PER_TURN`,
//!           `SPIN_DECELERATION_TURNS`, `SPIN_DEFAULT_TURNS`,
//!           `FRAME_INTERVAL_MS`, `COMMIT_ATTEMPTS`, `RECONNECT_DELAY_MS`

use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::spin::{SpinTiming, DEFAULT_TURNS};

/// `REGISTRY_URL` value that selects the in-process registry.
pub const MEMORY_REGISTRY: &str = "memory://";

/// Application configuration for the draw console backend.
#[derive(Clone)]
pub struct AppConfig {
    /// Root of the realtime database, or `memory://`.
    pub registry_url: String,
    /// Token appended to every registry request as `?auth=`.
    pub registry_auth: Option<String>,
    /// HTTP server port.
    pub http_port: u16,
    /// Time for one wheel turn at cruising speed.
    pub spin_ms_per_turn: u64,
    /// Trailing turns spent decelerating.
    pub spin_deceleration_turns: u32,
    /// Turns used when the stored spin settings give none.
    pub spin_default_turns: u32,
    /// Period of the frame loop.
    pub frame_interval_ms: u64,
    /// Conditional write attempts per commit.
    pub commit_attempts: u32,
    /// Delay before a dropped subscription reconnects.
    pub reconnect_delay_ms: u64,
}

/// Parse an optional variable, keeping `default` when it is unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let registry_url = std::env::var("REGISTRY_URL")
            .context("REGISTRY_URL env var must be set")?
            .trim()
            .trim_end_matches('/')
            .to_string();
        if registry_url != MEMORY_REGISTRY
            && !registry_url.starts_with("https://")
            && !registry_url.starts_with("http://")
        {
            bail!("invalid REGISTRY_URL: {registry_url:?} (expected http(s):// or {MEMORY_REGISTRY})");
        }

        let registry_auth = std::env::var("REGISTRY_AUTH")
            .ok()
            .filter(|token| !token.trim().is_empty());

        let config = Self {
            registry_url,
            registry_auth,
            http_port: env_or("HTTP_PORT", 8080)?,
            spin_ms_per_turn: env_or("SPIN_MS_PER_TURN", 1200)?,
            spin_deceleration_turns: env_or("SPIN_DECELERATION_TURNS", 2)?,
            spin_default_turns: env_or("SPIN_DEFAULT_TURNS", DEFAULT_TURNS)?,
            frame_interval_ms: env_or("FRAME_INTERVAL_MS", 16)?,
            commit_attempts: env_or("COMMIT_ATTEMPTS", 5)?,
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", 5000)?,
        };

        if config.frame_interval_ms == 0 {
            bail!("FRAME_INTERVAL_MS must be positive");
        }
        if config.commit_attempts == 0 {
            bail!("COMMIT_ATTEMPTS must be at least 1");
        }
        Ok(config)
    }

    pub fn uses_memory_registry(&self) -> bool {
        self.registry_url == MEMORY_REGISTRY
    }

    pub fn spin_timing(&self) -> SpinTiming {
        SpinTiming {
            per_turn: Duration::from_millis(self.spin_ms_per_turn),
            deceleration_turns: self.spin_deceleration_turns,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            timing: self.spin_timing(),
            default_turns: self.spin_default_turns,
            commit_attempts: self.commit_attempts,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
