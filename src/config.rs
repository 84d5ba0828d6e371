use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::AgentKind;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub quotas: QuotaConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub human: HumanConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Bounds on how much work one root task may create.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    /// Deepest `nesting_level` a sub-coordinator may run at.
    pub max_nesting_depth: u32,
    pub max_subtasks_per_decomposition: usize,
    /// Total descendants of one root task.
    pub max_subtasks_per_root: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_nesting_depth: 3,
            max_subtasks_per_decomposition: 12,
            max_subtasks_per_root: 60,
        }
    }
}

/// Concurrent in-flight activities per agent kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuotaConfig {
    pub default: usize,
    /// Agent name (`WriterAgent`, `writer`, ...) to maximum.
    pub per_agent: BTreeMap<String, usize>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default: 4,
            per_agent: BTreeMap::new(),
        }
    }
}

impl QuotaConfig {
    pub fn max_for(&self, kind: AgentKind) -> usize {
        self.per_agent
            .iter()
            .find(|(name, _)| AgentKind::parse(name) == Some(kind))
            .map(|(_, max)| *max)
            .unwrap_or(self.default)
    }

    /// Quota for every known kind. Unrecognized names are logged and ignored.
    pub fn resolve(&self) -> BTreeMap<AgentKind, usize> {
        for name in self.per_agent.keys() {
            if AgentKind::parse(name).is_none() {
                warn!(agent = %name, "Ignoring quota for unknown agent kind");
            }
        }
        AgentKind::ALL
            .iter()
            .map(|kind| (*kind, self.max_for(*kind)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            timeout_secs: 600,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HumanConfig {
    /// Seconds before a pending interaction expires. Unset means never.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Work units executed concurrently by `Orchestrator::run`.
    pub max_parallel_units: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_units: 8,
        }
    }
}

impl Config {
    pub fn cadre_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadre"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadre_dir()?.join("cadre.toml"))
    }

    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::cadre_dir()?.join("state.json"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            max_nesting_depth = config.limits.max_nesting_depth,
            default_quota = config.quotas.default,
            oracle = %config.oracle.command,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let cadre_dir = Self::cadre_dir()?;
        if !cadre_dir.exists() {
            debug!(dir = %cadre_dir.display(), "Creating cadre directory");
            fs::create_dir_all(&cadre_dir)?;
        }
        Ok(())
    }
}
