use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::types::TraderConfig;
use crate::manager::ManagerSettings;

/// Raw YAML shape. Env-expanded before parsing, then converted to [`ManagerSettings`] +
/// [`TraderConfig`] list via `TryFrom`, matching the broker's `from_env()` composition pattern
/// but sourced from a file instead of flat environment variables.
#[derive(Debug, Deserialize)]
struct RawConfig {
    manager: RawManagerSettings,
    providers: RawProviderSection,
    traders: Vec<TraderConfig>,
}

#[derive(Debug, Deserialize)]
struct RawManagerSettings {
    tick_interval_secs: u64,
    decision_interval_secs: u64,
    decision_timeout_secs: u64,
    shutdown_grace_secs: u64,
    max_concurrent_decisions: usize,
    total_equity_usd: Decimal,
    #[serde(default = "default_reserve_pct")]
    reserve_equity_pct: Decimal,
}

fn default_reserve_pct() -> Decimal {
    Decimal::new(10, 2)
}

#[derive(Debug, Deserialize)]
struct RawProviderSection {
    #[serde(default)]
    exchanges: Vec<ProviderEntry>,
    #[serde(default)]
    markets: Vec<ProviderEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub connection: std::collections::HashMap<String, String>,
}

pub struct AppConfig {
    pub manager: ManagerSettings,
    pub exchange_providers: Vec<ProviderEntry>,
    pub market_providers: Vec<ProviderEntry>,
    pub traders: Vec<TraderConfig>,
    pub database_url: String,
    pub llm_api_base: String,
    pub llm_api_key: String,
}

impl AppConfig {
    /// Loads configuration from a YAML file, expanding `${VAR}` / `${VAR:-default}` references
    /// against the process environment before parsing. Fails fast with full context on every
    /// sub-step, the same shape as the broker's env-composed `Config::from_env`.
    pub fn load(path: &str) -> Result<Self> {
        let raw_text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file at {path}"))?;
        let expanded = expand_env_vars(&raw_text)
            .with_context(|| "expanding ${VAR} references in config file")?;
        let raw: RawConfig = serde_yaml::from_str(&expanded)
            .with_context(|| "parsing config YAML")?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://perpetron.db".to_string());
        let llm_api_base = std::env::var("LLM_API_BASE")
            .context("LLM_API_BASE must be set")?;
        let llm_api_key = std::env::var("LLM_API_KEY")
            .context("LLM_API_KEY must be set")?;

        let total_pct: Decimal = raw.traders.iter().map(|t| t.allocation_pct).sum();
        if raw.traders.is_empty() {
            anyhow::bail!("at least one trader must be configured");
        }
        if (total_pct - Decimal::from(100)).abs() > Decimal::new(1, 0) {
            anyhow::bail!("trader allocation_pct values must sum to 100, got {total_pct}");
        }

        Ok(Self {
            manager: ManagerSettings {
                tick_interval: Duration::from_secs(raw.manager.tick_interval_secs),
                decision_interval: Duration::from_secs(raw.manager.decision_interval_secs),
                decision_timeout: Duration::from_secs(raw.manager.decision_timeout_secs),
                shutdown_grace: Duration::from_secs(raw.manager.shutdown_grace_secs),
                max_concurrent_decisions: raw.manager.max_concurrent_decisions,
                total_equity_usd: raw.manager.total_equity_usd,
                reserve_equity_pct: raw.manager.reserve_equity_pct,
            },
            exchange_providers: raw.providers.exchanges,
            market_providers: raw.providers.markets,
            traders: raw.traders,
            database_url,
            llm_api_base,
            llm_api_key,
        })
    }
}

/// Expands `${VAR}` and `${VAR:-default}` references against the process environment. Unknown
/// variables with no default fail loudly rather than being substituted with an empty string.
fn expand_env_vars(input: &str) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .context("unterminated ${...} reference in config file")?;
        let expr = &after[..end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        let value = match std::env::var(name) {
            Ok(v) => v,
            Err(_) => default
                .map(|d| d.to_string())
                .with_context(|| format!("environment variable {name} is not set and no default was given"))?,
        };
        output.push_str(&value);
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_plain_variable() {
        unsafe { std::env::set_var("PERPETRON_TEST_VAR", "hello") };
        let result = expand_env_vars("value: ${PERPETRON_TEST_VAR}").unwrap();
        assert_eq!(result, "value: hello");
    }

    #[test]
    fn expands_default_when_unset() {
        unsafe { std::env::remove_var("PERPETRON_TEST_MISSING") };
        let result = expand_env_vars("value: ${PERPETRON_TEST_MISSING:-fallback}").unwrap();
        assert_eq!(result, "value: fallback");
    }

    #[test]
    fn errors_on_missing_variable_without_default() {
        unsafe { std::env::remove_var("PERPETRON_TEST_MISSING_2") };
        assert!(expand_env_vars("value: ${PERPETRON_TEST_MISSING_2}").is_err());
    }
}
