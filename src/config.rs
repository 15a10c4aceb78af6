//! YAML configuration for the repo-updater daemon.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::CommandBackendConfig;
use crate::domain::{HostId, RepoRecord};
use crate::scheduler::{FairnessConfig, SchedulerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub scheduler: SchedulingConfig,
    pub codehosts: CodehostsConfig,
    pub backend: BackendConfig,
    pub store: StoreConfig,
    pub ipc: IpcConfig,
    /// Repositories registered at startup.
    pub repos: Vec<RepoRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub base_interval_secs: u64,
    pub max_interval_secs: u64,
    pub worker_pool_size: usize,
    pub max_schedule_size: usize,
    pub poll_interval_ms: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 60,
            max_interval_secs: 8 * 60 * 60,
            worker_pool_size: 8,
            max_schedule_size: 100_000,
            poll_interval_ms: 1000,
            fetch_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodehostsConfig {
    pub default_concurrency_limit: usize,
    pub limits: HashMap<String, usize>,
}

impl Default for CodehostsConfig {
    fn default() -> Self {
        Self {
            default_concurrency_limit: 4,
            limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub update_command: String,
    pub reclone_command: String,
    pub sync_command: String,
    pub repos_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let defaults = CommandBackendConfig::default();
        Self {
            update_command: defaults.update_command,
            reclone_command: defaults.reclone_command,
            sync_command: defaults.sync_command,
            repos_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("repo-updater")
                .join("repos"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file for the repo registry. In-memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
    pub max_clients: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/repo-updater.sock"),
            max_clients: 16,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            scheduler: SchedulingConfig::default(),
            codehosts: CodehostsConfig::default(),
            backend: BackendConfig::default(),
            store: StoreConfig::default(),
            ipc: IpcConfig::default(),
            repos: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Library scheduler settings derived from the file.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut fairness = FairnessConfig::new(self.codehosts.default_concurrency_limit);
        for (host, limit) in &self.codehosts.limits {
            fairness.limits.insert(HostId::new(host.as_str()), *limit);
        }

        SchedulerConfig {
            base_interval: Duration::from_secs(self.scheduler.base_interval_secs),
            max_interval: Duration::from_secs(self.scheduler.max_interval_secs),
            worker_pool_size: self.scheduler.worker_pool_size,
            max_schedule_size: self.scheduler.max_schedule_size,
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
            fetch_timeout: Duration::from_secs(self.scheduler.fetch_timeout_secs),
            fairness,
        }
    }

    pub fn backend_config(&self) -> CommandBackendConfig {
        CommandBackendConfig {
            update_command: self.backend.update_command.clone(),
            reclone_command: self.backend.reclone_command.clone(),
            sync_command: self.backend.sync_command.clone(),
            repos_dir: self.backend.repos_dir.clone(),
        }
    }

    /// Reject settings the daemon cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.scheduler_config().validate().context("Invalid scheduler settings")?;

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for repo in &self.repos {
            repo.validate().context(format!("Invalid seed repository {}", repo.name))?;
            if !ids.insert(repo.id) {
                eyre::bail!("Duplicate repository id {}", repo.id);
            }
            if !names.insert(repo.name.clone()) {
                eyre::bail!("Duplicate repository name {}", repo.name);
            }
        }
        Ok(())
    }
}
