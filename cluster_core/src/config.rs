//! Service configuration read from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `API_PORT` | `8080` |
//! | `LOG_LEVEL` | `info` |
//! | `LOG_JSON` | `false` |
//! | `AUTH_DISABLED` | `false` |
//! | `IDENTITY_URL` | unset, tokens are checked by a static in-process directory |
//! | `ADMIN_TOKEN` | unset, admin token registered in the static directory |
//! | `DEPLOY_MODULE_URL` | unset, deployment runs in process |
//! | `PROVISIONER` | `docker-machine` (or `mock`) |
//! | `DOCKER_MACHINE_BINARY` | `docker-machine` |
//! | `DOCKER_COMPOSE_BINARY` | `docker-compose` |
//! | `MACHINE_STORAGE_ROOT` | `/linker/docker` |
//! | `COMPOSE_ROOT` | `/linker/compose` |
//! | `TEMPLATE_DIR` | `/linker/marathon` |
//! | `CONFIG_DIR` | `/linker/config` |
//! | `MONGODB_KEYFILE` | `/linker/key/mongodb-keyfile` |
//! | `SSH_KEY_SCRIPT` | `/linker/copy-ssh-id.sh` |
//! | `PLATFORM_PUBLIC_KEY` | `/linker/key/id_rsa.pub` |
//! | `COMMAND_TIMEOUT_SECS` | `900` |
//! | `SCHEDULER_POLL_ATTEMPTS` | `100` |
//! | `SCHEDULER_POLL_INTERVAL_SECS` | `30` |
//! | `WORKFLOW_CONCURRENCY` | `8` |
//! | `STUCK_RECORD_TIMEOUT_SECS` | `0` (sweeper off) |
//! | `PROVIDER_CONFIG` | unset, empty provider |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cluster_shared_types::ProviderInfo;
use provisioner::DockerMachineConfig;
use scheduler_interface::DeploymentPoller;

use crate::deploy::DeployerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerKind {
    DockerMachine,
    Mock,
}

impl FromStr for ProvisionerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker-machine" | "docker_machine" => Ok(ProvisionerKind::DockerMachine),
            "mock" => Ok(ProvisionerKind::Mock),
            other => bail!("unknown provisioner '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub auth_disabled: bool,
    pub identity_url: Option<String>,
    pub admin_token: Option<String>,
    pub deploy_module_url: Option<String>,
    pub provisioner: ProvisionerKind,
    pub docker_machine_binary: PathBuf,
    pub docker_compose_binary: PathBuf,
    pub machine_storage_root: PathBuf,
    pub compose_root: PathBuf,
    pub template_dir: PathBuf,
    pub config_dir: PathBuf,
    pub mongodb_keyfile: PathBuf,
    pub ssh_key_script: PathBuf,
    pub platform_public_key: PathBuf,
    pub command_timeout: Duration,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub workflow_concurrency: usize,
    pub stuck_record_timeout: Duration,
    pub provider_config: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset and empty values
    /// take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let string = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str, default: &str| PathBuf::from(string(key, default));
        let flag = |key: &str| {
            get(key)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(false)
        };
        fn number<T>(value: Option<String>, key: &str, default: T) -> Result<T>
        where
            T: FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match value {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid {}: '{}'", key, raw)),
                None => Ok(default),
            }
        }

        let provisioner = match get("PROVISIONER") {
            Some(raw) => raw.parse().context("Invalid PROVISIONER")?,
            None => ProvisionerKind::DockerMachine,
        };

        Ok(Self {
            api_port: number(get("API_PORT"), "API_PORT", 8080)?,
            log_level: string("LOG_LEVEL", "info"),
            log_json: flag("LOG_JSON"),
            auth_disabled: flag("AUTH_DISABLED"),
            identity_url: get("IDENTITY_URL"),
            admin_token: get("ADMIN_TOKEN"),
            deploy_module_url: get("DEPLOY_MODULE_URL"),
            provisioner,
            docker_machine_binary: path("DOCKER_MACHINE_BINARY", "docker-machine"),
            docker_compose_binary: path("DOCKER_COMPOSE_BINARY", "docker-compose"),
            machine_storage_root: path("MACHINE_STORAGE_ROOT", "/linker/docker"),
            compose_root: path("COMPOSE_ROOT", "/linker/compose"),
            template_dir: path("TEMPLATE_DIR", "/linker/marathon"),
            config_dir: path("CONFIG_DIR", "/linker/config"),
            mongodb_keyfile: path("MONGODB_KEYFILE", "/linker/key/mongodb-keyfile"),
            ssh_key_script: path("SSH_KEY_SCRIPT", "/linker/copy-ssh-id.sh"),
            platform_public_key: path("PLATFORM_PUBLIC_KEY", "/linker/key/id_rsa.pub"),
            command_timeout: Duration::from_secs(number(
                get("COMMAND_TIMEOUT_SECS"),
                "COMMAND_TIMEOUT_SECS",
                900,
            )?),
            poll_attempts: number(get("SCHEDULER_POLL_ATTEMPTS"), "SCHEDULER_POLL_ATTEMPTS", 100)?,
            poll_interval: Duration::from_secs(number(
                get("SCHEDULER_POLL_INTERVAL_SECS"),
                "SCHEDULER_POLL_INTERVAL_SECS",
                30,
            )?),
            workflow_concurrency: number(get("WORKFLOW_CONCURRENCY"), "WORKFLOW_CONCURRENCY", 8)?,
            stuck_record_timeout: Duration::from_secs(number(
                get("STUCK_RECORD_TIMEOUT_SECS"),
                "STUCK_RECORD_TIMEOUT_SECS",
                0,
            )?),
            provider_config: get("PROVIDER_CONFIG").map(PathBuf::from),
        })
    }

    pub fn deployer_config(&self) -> DeployerConfig {
        DeployerConfig {
            template_dir: self.template_dir.clone(),
            config_dir: self.config_dir.clone(),
            mongodb_keyfile: self.mongodb_keyfile.clone(),
            poller: DeploymentPoller::new(self.poll_attempts, self.poll_interval),
        }
    }

    pub fn docker_machine_config(&self) -> DockerMachineConfig {
        DockerMachineConfig {
            machine_binary: self.docker_machine_binary.clone(),
            compose_binary: self.docker_compose_binary.clone(),
            storage_root: self.machine_storage_root.clone(),
            ssh_key_script: self.ssh_key_script.clone(),
            platform_public_key: self.platform_public_key.clone(),
            command_timeout: self.command_timeout,
            ..Default::default()
        }
    }

    /// Provider used for new machines; empty when no file is configured.
    pub fn provider_info(&self) -> Result<ProviderInfo> {
        match &self.provider_config {
            Some(path) => load_provider(path),
            None => Ok(ProviderInfo::default()),
        }
    }
}

pub fn load_provider(path: &Path) -> Result<ProviderInfo> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read provider config {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("Invalid provider config {}", path.display()))
}
