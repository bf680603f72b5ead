//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::ErrorKind;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket endpoint of the remote authority.
    pub channel_url: String,
    pub reconnect_delay_sec: u64,
    /// Give up on a WebSocket handshake that has not completed by then.
    pub connect_timeout_sec: u64,
    /// Ping period on an open channel. Two silent periods close the link.
    pub keep_alive_sec: u64,
    /// Period of the humidity simulator.
    pub tick_interval_sec: u64,
    pub recommendation_url: String,
    pub recommendation_timeout_sec: u64,
    pub web_port: u16,
    /// Narrate fresh advice whenever a recomputation changes it.
    pub narrate_advisories: bool,
    pub speech: SpeechConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub command: String,
    /// Arguments passed before the utterance, which is written to stdin.
    pub args: Vec<String>,
    /// Kill a synthesizer that is still running after this long.
    pub timeout_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_url: "ws://localhost:8000/ws".to_string(),
            reconnect_delay_sec: 5,
            connect_timeout_sec: 10,
            keep_alive_sec: 30,
            tick_interval_sec: 5,
            recommendation_url: "http://localhost:8000/get-recommendation".to_string(),
            recommendation_timeout_sec: 30,
            web_port: 8080,
            narrate_advisories: false,
            speech: SpeechConfig::default(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "espeak-ng".to_string(),
            args: vec!["-v".to_string(), "ar".to_string(), "--stdin".to_string()],
            timeout_sec: 30,
        }
    }
}

impl Config {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_sec)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_sec)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_sec)
    }

    pub fn recommendation_timeout(&self) -> Duration {
        Duration::from_secs(self.recommendation_timeout_sec)
    }

    /// Apply `CHANNEL_URL`, `RECOMMENDATION_URL` and `WEB_PORT` overrides.
    /// `var` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("CHANNEL_URL") {
            self.channel_url = url;
        }
        if let Some(url) = var("RECOMMENDATION_URL") {
            self.recommendation_url = url;
        }
        if let Some(port) = var("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.web_port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every entry. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !has_scheme(&self.channel_url, &["ws://"]) {
            errors.push(format!(
                "channel_url '{}' must start with ws://",
                self.channel_url
            ));
        }
        if !has_scheme(&self.recommendation_url, &["http://", "https://"]) {
            errors.push(format!(
                "recommendation_url '{}' must start with http:// or https://",
                self.recommendation_url
            ));
        }

        for (name, value) in [
            ("reconnect_delay_sec", self.reconnect_delay_sec),
            ("connect_timeout_sec", self.connect_timeout_sec),
            ("keep_alive_sec", self.keep_alive_sec),
            ("tick_interval_sec", self.tick_interval_sec),
            ("recommendation_timeout_sec", self.recommendation_timeout_sec),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }

        if self.web_port == 0 {
            errors.push("web_port must be non-zero".to_string());
        }

        if self.speech.enabled && self.speech.command.trim().is_empty() {
            errors.push("speech.command is empty while speech is enabled".to_string());
        }
        if self.speech.timeout_sec == 0 {
            errors.push("speech.timeout_sec must be positive, got 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    schemes
        .iter()
        .any(|s| url.starts_with(s) && url.len() > s.len())
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file means "all defaults";
/// environment overrides are applied before validation.
pub fn load(path: &str) -> Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<Config>(&contents)
            .with_context(|| format!("failed to parse config: {path}"))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path, "no config file, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config: {path}"));
        }
    };

    config.apply_overrides(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
