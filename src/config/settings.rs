/*
* Cloud Scheduler Configuration
* -----------------------------
* @project: cloud-scheduler
* @status: parses-on-my-machine-certified
*
* Layered settings, lowest priority first:
*   1. Hardcoded defaults (for when everything else fails spectacularly)
*   2. <CONFIG_PATH>/default.toml
*   3. <CONFIG_PATH>/local.toml (optional, your private overrides)
*   4. Environment variables, CLOUDSCHED__SCHEDULER__KILL_GRACE_SECS style
*
* The cluster inventory lives here too. Each [[clusters]] entry is validated
* into a ClusterSpec before it gets anywhere near a pool: a typo in a memory
* list fails loudly at startup instead of quietly starving the scheduler.
*
* Memory is written the old-school way, one free-MB figure per worker node:
*   memory = "2048,2048,1024"
*/

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::{ClusterSpec, LifecyclePolicy};
use crate::errors::{ConfigError, RetryPolicy};

pub const KNOWN_CLOUD_TYPES: &[&str] = &["Nimbus", "StratusLab", "Simulated"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub nimbus: NimbusSettings,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub pool_name: String,
    pub destroy_attempts: u32,
    pub destroy_retry_delay_secs: u64,
    pub backend_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pool_name: "default".to_string(),
            destroy_attempts: 3,
            destroy_retry_delay_secs: 5,
            backend_timeout_secs: 30,
            kill_grace_secs: 90,
            poll_interval_secs: 30,
        }
    }
}

impl SchedulerSettings {
    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        let backend_timeout = Duration::from_secs(self.backend_timeout_secs);
        LifecyclePolicy {
            destroy_retry: RetryPolicy::new(
                self.destroy_attempts,
                Duration::from_secs(self.destroy_retry_delay_secs),
                backend_timeout,
            ),
            backend_timeout,
            kill_grace: Duration::from_secs(self.kill_grace_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusSettings {
    pub workspace_bin: String,
    pub service_port: u16,
    pub deploy_duration_mins: u32,
    pub work_dir: PathBuf,
    pub log_file: PathBuf,
}

impl Default for NimbusSettings {
    fn default() -> Self {
        Self {
            workspace_bin: "workspace".to_string(),
            service_port: 8443,
            deploy_duration_mins: 1000,
            work_dir: PathBuf::from("/var/lib/cloud-scheduler/nimbus"),
            log_file: PathBuf::from("vm.log"),
        }
    }
}

/// One `[[clusters]]` entry as written in the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub address: String,
    pub cloud_type: String,
    pub vm_slots: u32,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub storage_gb: u64,
    pub memory: String,
    pub cpu_archs: Vec<String>,
    pub networks: Vec<String>,
}

impl ClusterConfig {
    pub fn to_spec(&self) -> Result<ClusterSpec, ConfigError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ConfigError::MissingField {
                cluster: "<unnamed>".to_string(),
                field: "name",
            });
        }

        let cloud_type = KNOWN_CLOUD_TYPES
            .iter()
            .find(|known| known.eq_ignore_ascii_case(self.cloud_type.trim()))
            .ok_or_else(|| ConfigError::UnsupportedCloudType {
                cluster: name.to_string(),
                cloud_type: self.cloud_type.clone(),
            })?;

        let cpu_archs = non_empty_set(name, "cpu_archs", &self.cpu_archs)?;
        let network_pools = non_empty_set(name, "networks", &self.networks)?;

        Ok(ClusterSpec {
            name: name.to_string(),
            network_address: self.address.trim().to_string(),
            cloud_type: cloud_type.to_string(),
            vm_slots: self.vm_slots,
            cpu_cores: self.cpu_cores,
            storage_gb: self.storage_gb,
            memory_blocks: parse_memory_list(name, &self.memory)?,
            cpu_archs,
            network_pools,
        })
    }
}

fn non_empty_set(cluster: &str, field: &'static str, values: &[String]) -> Result<BTreeSet<String>, ConfigError> {
    let set: BTreeSet<String> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if set.is_empty() {
        return Err(ConfigError::MissingField {
            cluster: cluster.to_string(),
            field,
        });
    }
    Ok(set)
}

/// Parses `"2048,2048,1024"` into per-node free memory figures.
pub fn parse_memory_list(cluster: &str, value: &str) -> Result<Vec<u64>, ConfigError> {
    let invalid = || ConfigError::InvalidMemoryList {
        cluster: cluster.to_string(),
        value: value.to_string(),
    };

    if value.trim().is_empty() {
        return Err(invalid());
    }
    value
        .split(',')
        .map(|entry| entry.trim().parse::<u64>().map_err(|_| invalid()))
        .collect()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        Self::from_dir(Path::new(&config_path))
    }

    pub fn from_dir(dir: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", dir.display());

        let config = Self::builder()?
            .add_source(File::with_name(&format!("{}/default", dir.display())).required(false))
            .add_source(File::with_name(&format!("{}/local", dir.display())).required(false))
            .add_source(Environment::with_prefix("CLOUDSCHED").separator("__").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());

        let config = Self::builder()?
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("CLOUDSCHED").separator("__").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = SchedulerSettings::default();
        Ok(Config::builder()
            .set_default("scheduler.pool_name", defaults.pool_name)?
            .set_default("scheduler.destroy_attempts", i64::from(defaults.destroy_attempts))?
            .set_default("scheduler.kill_grace_secs", defaults.kill_grace_secs as i64)?)
    }

    /// Validates every cluster entry. One bad entry fails the whole load.
    pub fn cluster_specs(&self) -> Result<Vec<ClusterSpec>, ConfigError> {
        self.clusters.iter().map(ClusterConfig::to_spec).collect()
    }

    pub fn write_toml(&self, path: &Path) -> Result<(), ConfigError> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        scheduler: SchedulerSettings::default(),
        nimbus: NimbusSettings::default(),
        clusters: vec![
            ClusterConfig {
                name: "alpha".to_string(),
                address: "alpha.cloud.example.org".to_string(),
                cloud_type: "Simulated".to_string(),
                vm_slots: 4,
                cpu_cores: 16,
                storage_gb: 500,
                memory: "2048,2048,1024".to_string(),
                cpu_archs: vec!["x86".to_string()],
                networks: vec!["public".to_string(), "private".to_string()],
            },
            ClusterConfig {
                name: "beta".to_string(),
                address: "beta.cloud.example.org".to_string(),
                cloud_type: "Simulated".to_string(),
                vm_slots: 2,
                cpu_cores: 8,
                storage_gb: 250,
                memory: "4096".to_string(),
                cpu_archs: vec!["x86".to_string(), "x86_64".to_string()],
                networks: vec!["public".to_string()],
            },
        ],
    }
}
