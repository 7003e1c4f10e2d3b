use async_trait::async_trait;
use cluster_shared_types::{ClusterError, ProviderInfo, Result, Server};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine label attached to a machine at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineLabel {
    pub key: String,
    pub value: String,
}

impl MachineLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn master() -> Self {
        Self::new("master", "true")
    }

    pub fn slave() -> Self {
        Self::new("slave", "true")
    }

    pub fn request(request_id: &str) -> Self {
        Self::new("requestId", request_id)
    }
}

/// What to create: one machine of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub user_name: String,
    pub cluster_name: String,
    /// Join the swarm through the coordination node.
    pub swarm: bool,
    pub swarm_master: bool,
    /// Hostname of the coordination node; required when `swarm` is set.
    pub consul_host: Option<String>,
    pub provider: ProviderInfo,
    pub labels: Vec<MachineLabel>,
}

/// Resize request for the composed scheduler stack of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeScale {
    /// Swarm leader the composition tool talks to.
    pub swarm_master: String,
    pub storage_path: String,
    pub compose_file: PathBuf,
    pub workers: u32,
}

/// Trait for creating, configuring and removing cluster machines.
///
/// Implementations know nothing about cluster topology; callers decide which
/// machine plays which role.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates a machine, fixes its hosts file and installs the platform SSH
    /// key. `is_fullfilled` on the result reports whether the key step worked.
    async fn create_machine(&self, spec: &MachineSpec) -> Result<Server>;

    /// Removes a machine and its provisioning state.
    async fn delete_machine(&self, hostname: &str, storage_path: &str) -> Result<()>;

    /// Runs a shell command on a machine and returns its stdout.
    async fn run_on_machine(&self, hostname: &str, command: &str, storage_path: &str)
        -> Result<String>;

    /// Copies a local file to a machine.
    async fn copy_to_machine(
        &self,
        hostname: &str,
        local_path: &Path,
        remote_path: &str,
        storage_path: &str,
    ) -> Result<()>;

    /// Starts the coordination service on the given machine.
    async fn boot_coordination(&self, server: &Server) -> Result<()>;

    /// Scales the composed scheduler stack through the swarm leader.
    async fn compose_scale(&self, scale: &ComposeScale) -> Result<()>;

    /// Directory holding the provisioning state for a cluster's machines.
    fn storage_path(&self, user_name: &str, cluster_name: &str) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },
    #[error("Command timed out: {0}")]
    Timeout(String),
    #[error("Unexpected command output: {0}")]
    InvalidOutput(String),
    #[error("Machine not found: {0}")]
    MachineNotFound(String),
    #[error("Underlying I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<ProvisioningError> for ClusterError {
    fn from(err: ProvisioningError) -> Self {
        ClusterError::ProvisioningError(err.to_string())
    }
}
