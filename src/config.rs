use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::ladder::LadderConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    pub batch_size: usize,
    pub time_budget_secs: u64,
    pub inter_batch_delay_ms: u64,
    pub ladder: LadderConfig,
    pub ladder_backoff_ms: u64,
    /// Candidate coverage ratio at which a run is skipped entirely.
    pub coverage_short_circuit: f64,
    pub recovery: RecoveryConfig,
    pub reachability: ReachabilityConfig,
    pub grounding: GroundingConfig,
    pub alternates: AlternatesPolicy,
    pub max_attempts: u8,
    pub validation: ValidationConfig,
    pub blocker_owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_components: usize,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub ladder_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub concurrency: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingConfig {
    /// URL prefixes of provider-issued redirect links; such links count as attested.
    pub redirect_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub lease_ttl_secs: u64,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlternatesPolicy {
    Discard,
    Retain,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            batch_size: 6,
            time_budget_secs: 14 * 60,
            inter_batch_delay_ms: 5_000,
            ladder: LadderConfig::default(),
            ladder_backoff_ms: 4_000,
            coverage_short_circuit: 0.95,
            recovery: RecoveryConfig::default(),
            reachability: ReachabilityConfig::default(),
            grounding: GroundingConfig::default(),
            alternates: AlternatesPolicy::Discard,
            max_attempts: 2,
            validation: ValidationConfig::default(),
            blocker_owner: "curation-team".to_owned(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_components: 50,
            batch_size: 3,
            inter_batch_delay_ms: 2_000,
            ladder_backoff_ms: 2_000,
        }
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 8_000,
            max_redirects: 10,
            concurrency: 4,
            user_agent: concat!("sourcegate/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            redirect_prefixes: vec![
                "https://vertexaisearch.cloud.google.com/grounding-api-redirect/".to_owned(),
            ],
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 600,
            chunk_size: 8,
        }
    }
}

impl CurationConfig {
    /// Defaults, then the optional YAML file, then `SOURCEGATE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)
                    .with_context(|| format!("read config: {}", path.display()))?;
                serde_yaml::from_str(&yaml)
                    .with_context(|| format!("parse config: {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |key: &str| var(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        if let Some(v) = get("SOURCEGATE_BATCH_SIZE") {
            self.batch_size = v.parse().context("parse SOURCEGATE_BATCH_SIZE")?;
        }
        if let Some(v) = get("SOURCEGATE_TIME_BUDGET_SECS") {
            self.time_budget_secs = v.parse().context("parse SOURCEGATE_TIME_BUDGET_SECS")?;
        }
        if let Some(v) = get("SOURCEGATE_INTER_BATCH_DELAY_MS") {
            self.inter_batch_delay_ms =
                v.parse().context("parse SOURCEGATE_INTER_BATCH_DELAY_MS")?;
        }
        if let Some(v) = get("SOURCEGATE_PRIMARY_MODEL") {
            self.ladder.primary_model = v;
        }
        if let Some(v) = get("SOURCEGATE_PRIMARY_TEMPERATURE") {
            self.ladder.primary_temperature =
                v.parse().context("parse SOURCEGATE_PRIMARY_TEMPERATURE")?;
        }
        if let Some(v) = get("SOURCEGATE_SECONDARY_MODEL") {
            self.ladder.secondary_model = v;
        }
        if let Some(v) = get("SOURCEGATE_LADDER_BACKOFF_MS") {
            self.ladder_backoff_ms = v.parse().context("parse SOURCEGATE_LADDER_BACKOFF_MS")?;
        }
        if let Some(v) = get("SOURCEGATE_PROBE_TIMEOUT_MS") {
            self.reachability.timeout_ms =
                v.parse().context("parse SOURCEGATE_PROBE_TIMEOUT_MS")?;
        }
        if let Some(v) = get("SOURCEGATE_PROBE_CONCURRENCY") {
            self.reachability.concurrency =
                v.parse().context("parse SOURCEGATE_PROBE_CONCURRENCY")?;
        }
        if let Some(v) = get("SOURCEGATE_ALTERNATES") {
            self.alternates = match v.to_ascii_lowercase().as_str() {
                "discard" => AlternatesPolicy::Discard,
                "retain" => AlternatesPolicy::Retain,
                other => anyhow::bail!(
                    "invalid SOURCEGATE_ALTERNATES={other:?}. expected one of: discard, retain"
                ),
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        if self.recovery.batch_size == 0 {
            anyhow::bail!("recovery.batch_size must be > 0");
        }
        if !(0.0..=1.0).contains(&self.coverage_short_circuit) {
            anyhow::bail!("coverage_short_circuit must be within 0.0..=1.0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be > 0");
        }
        if self.ladder.primary_model.trim().is_empty() {
            anyhow::bail!("ladder.primary_model is empty");
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn ladder_backoff(&self) -> Duration {
        Duration::from_millis(self.ladder_backoff_ms)
    }
}

impl ReachabilityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn yaml_overrides_only_given_fields() -> anyhow::Result<()> {
        let config: CurationConfig = serde_yaml::from_str(
            "batch_size: 8\nrecovery:\n  max_components: 10\nalternates: retain\n",
        )?;
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.recovery.max_components, 10);
        assert_eq!(config.recovery.batch_size, 3);
        assert_eq!(config.alternates, AlternatesPolicy::Retain);
        assert_eq!(config.time_budget_secs, 840);
        Ok(())
    }

    #[test]
    fn env_overrides_apply() -> anyhow::Result<()> {
        let env = HashMap::from([
            ("SOURCEGATE_BATCH_SIZE", "5"),
            ("SOURCEGATE_PRIMARY_MODEL", "gpt-test"),
            ("SOURCEGATE_ALTERNATES", " Retain "),
        ]);
        let mut config = CurationConfig::default();
        config.apply_env(|key| env.get(key).map(|v| (*v).to_owned()))?;
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.ladder.primary_model, "gpt-test");
        assert_eq!(config.alternates, AlternatesPolicy::Retain);
        Ok(())
    }

    #[test]
    fn invalid_env_is_reported() {
        let mut config = CurationConfig::default();
        let err = config
            .apply_env(|key| (key == "SOURCEGATE_ALTERNATES").then(|| "keep".to_owned()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("invalid SOURCEGATE_ALTERNATES"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = CurationConfig {
            batch_size: 0,
            ..CurationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
