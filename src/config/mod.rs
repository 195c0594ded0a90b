pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ResinConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the proxy starts with zero configuration for local
    /// development (no platforms, auth disabled).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ResinConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            ResinConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded proxy configuration");
        Ok(config)
    }

    /// Apply environment variable overrides for secrets and feature flags.
    /// Platform/node topology is file-only.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RESIN_PROXY_TOKEN") {
            self.proxy.token = v;
        }
        if let Ok(v) = std::env::var("RESIN_REVERSE_TOKEN") {
            self.proxy.reverse_token = v;
        }
        if let Ok(v) = std::env::var("RESIN_REQUEST_LOG_ENABLED") {
            self.request_log.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("RESIN_REVERSE_DETAIL_ENABLED") {
            self.request_log.reverse_detail_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("RESIN_BUCKET_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.metrics.bucket_seconds = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.metrics.bucket_seconds <= 0 {
            anyhow::bail!("metrics.bucket_seconds must be positive");
        }
        if self.metrics.latency_bin_ms == 0 || self.metrics.latency_over_ms == 0 {
            anyhow::bail!("latency histogram bin/overflow must be positive");
        }
        if self.metrics.latency_over_ms < self.metrics.latency_bin_ms {
            anyhow::bail!("metrics.latency_over_ms must be >= latency_bin_ms");
        }

        let mut defaults = 0;
        for p in &self.platforms {
            if p.id.is_empty() {
                anyhow::bail!("platform id cannot be empty");
            }
            if p.name.is_empty() {
                anyhow::bail!("platform name cannot be empty, id={}", p.id);
            }
            if p.is_default {
                defaults += 1;
            }
            for n in &p.nodes {
                if n.address.is_empty() {
                    anyhow::bail!("node address cannot be empty, platform={}", p.name);
                }
            }
        }
        if defaults > 1 {
            anyhow::bail!("at most one platform may be marked default");
        }

        for rule in &self.account_rules {
            if rule.prefix.trim().is_empty() {
                anyhow::bail!("account rule prefix cannot be empty");
            }
        }
        Ok(())
    }
}
