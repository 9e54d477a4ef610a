//! Runtime configuration: spec-pack location, rules and policy paths,
//! executor limits, and the receipt signing secret.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::executor::ExecutorConfig;
use crate::receipt::SigningKey;

pub const ENV_SPEC_PACK: &str = "HYPERSYNC_SPEC_PACK";
pub const ENV_RULES: &str = "HYPERSYNC_RULES";
pub const ENV_POLICY: &str = "HYPERSYNC_POLICY";
pub const ENV_TIMEOUT_MS: &str = "HYPERSYNC_TIMEOUT_MS";
pub const ENV_MAX_WORKERS: &str = "HYPERSYNC_MAX_WORKERS";
pub const ENV_HMAC_SECRET: &str = "HYPERSYNC_HMAC_SECRET";

pub const DEFAULT_SPEC_PACK: &str = "packs/default";
pub const RULES_FILE: &str = "rules.json";
pub const POLICY_FILE: &str = "policy.json";

/// Everything needed to assemble a [`crate::runtime::Runtime`] from disk.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub spec_pack: PathBuf,
    /// Rules document; `<spec_pack>/rules.json` when unset.
    pub rules_path: Option<PathBuf>,
    /// Policy document; `<spec_pack>/policy.json` when unset.
    pub policy_path: Option<PathBuf>,
    pub executor: ExecutorConfig,
    /// Receipts are signed only when a secret is configured.
    pub hmac_secret: Option<SigningKey>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spec_pack: PathBuf::from(DEFAULT_SPEC_PACK),
            rules_path: None,
            policy_path: None,
            executor: ExecutorConfig::default(),
            hmac_secret: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new(spec_pack: impl Into<PathBuf>) -> Self {
        Self {
            spec_pack: spec_pack.into(),
            ..Self::default()
        }
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - HYPERSYNC_SPEC_PACK (optional, default: "packs/default")
    /// - HYPERSYNC_RULES (optional, default: "<pack>/rules.json")
    /// - HYPERSYNC_POLICY (optional, default: "<pack>/policy.json")
    /// - HYPERSYNC_TIMEOUT_MS (optional, default: 30000)
    /// - HYPERSYNC_MAX_WORKERS (optional, default: 4)
    /// - HYPERSYNC_HMAC_SECRET (optional; empty means unsigned)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(pack) = lookup(ENV_SPEC_PACK) {
            config.spec_pack = PathBuf::from(pack);
        }
        config.rules_path = lookup(ENV_RULES).map(PathBuf::from);
        config.policy_path = lookup(ENV_POLICY).map(PathBuf::from);
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            config.executor.timeout_ms = parse_positive(ENV_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_WORKERS) {
            config.executor.max_workers = parse_positive(ENV_MAX_WORKERS, &raw)?;
        }
        config.hmac_secret = lookup(ENV_HMAC_SECRET)
            .filter(|s| !s.is_empty())
            .map(|s| SigningKey::from(s.as_str()));
        Ok(config)
    }

    pub fn with_rules(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = Some(path.into());
        self
    }

    pub fn with_policy(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_path = Some(path.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.executor.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.executor.max_workers = max_workers;
        self
    }

    pub fn with_secret(mut self, secret: SigningKey) -> Self {
        self.hmac_secret = Some(secret);
        self
    }

    pub fn rules_file(&self) -> PathBuf {
        resolve(&self.rules_path, &self.spec_pack, RULES_FILE)
    }

    pub fn policy_file(&self) -> PathBuf {
        resolve(&self.policy_path, &self.spec_pack, POLICY_FILE)
    }
}

fn resolve(explicit: &Option<PathBuf>, pack: &Path, default_name: &str) -> PathBuf {
    explicit.clone().unwrap_or_else(|| pack.join(default_name))
}

fn parse_positive<T>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.trim()
        .parse::<T>()
        .ok()
        .filter(|v| *v > T::default())
        .ok_or_else(|| ConfigError::InvalidEnv {
            var: var.to_string(),
            value: raw.to_string(),
        })
}
