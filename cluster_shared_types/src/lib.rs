use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod scheduler;
pub mod wire;

pub use scheduler::{App, Container, DnsConfig, DockerContainer, Group, PortMapping, ServiceGroup};
pub use wire::{
    AddNodeRequest, AwsEc2Info, DeleteRequest, DeployRequest, NodeBatch, OpenstackInfo, Provider,
    ProviderInfo, ProviderType, StageFailure,
};

pub type ClusterId = Uuid;
pub type HostId = Uuid;

/// Minimum number of hosts a cluster may be created with or scaled down to.
pub const MIN_CLUSTER_SIZE: u32 = 5;

/// Default name given to the management cluster.
pub const MGMT_CLUSTER_NAME: &str = "Management";

/// Default description given to the management cluster.
pub const MGMT_CLUSTER_DETAILS: &str = "Cluster to manage other clusters";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Not authorized: {0}")]
    Unauthorized(String),
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Operation not allowed in current state: {0}")]
    InvalidState(String),
    #[error("State persistence error: {0}")]
    StateError(String),
    #[error("Identity service error: {0}")]
    IdentityError(String),
    #[error("Provisioning error: {0}")]
    ProvisioningError(String),
    #[error("Scheduler error: {0}")]
    SchedulerError(String),
    #[error("Deployment failed at {stage}: {message}")]
    DeploymentFailed { stage: DeployStage, message: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("{failed} of {total} operations failed, first error: {first}")]
    BatchFailed {
        failed: usize,
        total: usize,
        first: Box<ClusterError>,
    },
}

impl ClusterError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        ClusterError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn deployment(stage: DeployStage, message: impl Into<String>) -> Self {
        ClusterError::DeploymentFailed {
            stage,
            message: message.into(),
        }
    }

    /// Classifies the error for propagation and transport mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Validation(_) => ErrorKind::Validation,
            ClusterError::Unauthorized(_) => ErrorKind::Unauthorized,
            ClusterError::NotFound { .. } => ErrorKind::NotFound,
            ClusterError::Conflict(_) => ErrorKind::Conflict,
            ClusterError::InvalidState(_) => ErrorKind::StateConflict,
            ClusterError::StateError(_) | ClusterError::IdentityError(_) => ErrorKind::Upstream,
            ClusterError::ProvisioningError(_) | ClusterError::SchedulerError(_) => {
                ErrorKind::Provisioning
            }
            ClusterError::DeploymentFailed { .. } => ErrorKind::Deployment,
            ClusterError::ConfigError(_) | ClusterError::InternalError(_) => ErrorKind::Internal,
            ClusterError::BatchFailed { first, .. } => first.kind(),
        }
    }

    /// Stage of the deployment workflow that produced this error, if any.
    pub fn stage(&self) -> Option<DeployStage> {
        match self {
            ClusterError::DeploymentFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Conflict,
    StateConflict,
    NotFound,
    Upstream,
    Provisioning,
    Deployment,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code used in API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::StateConflict => "INVALID_STATE",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Upstream => "UPSTREAM_ERROR",
            ErrorKind::Provisioning => "PROVISIONING_ERROR",
            ErrorKind::Deployment => "DEPLOYMENT_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Step of the deployment module at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    CoordinationNode,
    CreateMachine,
    Compose,
    DnsConfig,
    CopyConfig,
    Nameserver,
    SchedulerGroup,
    DeleteNode,
    DeleteCluster,
    AddNodeMachine,
    AddNodeCompose,
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeployStage::CoordinationNode => "coordination node",
            DeployStage::CreateMachine => "machine creation",
            DeployStage::Compose => "cluster composition",
            DeployStage::DnsConfig => "dns config",
            DeployStage::CopyConfig => "config copy",
            DeployStage::Nameserver => "nameserver change",
            DeployStage::SchedulerGroup => "scheduler group",
            DeployStage::DeleteNode => "node deletion",
            DeployStage::DeleteCluster => "cluster deletion",
            DeployStage::AddNodeMachine => "add-node machine creation",
            DeployStage::AddNodeCompose => "add-node composition",
        };
        f.write_str(name)
    }
}

// Lifecycle shared by clusters and hosts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Deploying,
    Running,
    Failed,
    Terminating,
    Terminated,
}

pub type ClusterStatus = LifecycleStatus;
pub type HostStatus = LifecycleStatus;

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Deploying => "DEPLOYING",
            LifecycleStatus::Running => "RUNNING",
            LifecycleStatus::Failed => "FAILED",
            LifecycleStatus::Terminating => "TERMINATING",
            LifecycleStatus::Terminated => "TERMINATED",
        }
    }

    /// Deploying and terminating records have a workflow in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            LifecycleStatus::Deploying | LifecycleStatus::Terminating
        )
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEPLOYING" => Ok(LifecycleStatus::Deploying),
            "RUNNING" => Ok(LifecycleStatus::Running),
            "FAILED" => Ok(LifecycleStatus::Failed),
            "TERMINATING" => Ok(LifecycleStatus::Terminating),
            "TERMINATED" => Ok(LifecycleStatus::Terminated),
            other => Err(ClusterError::Validation(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    #[default]
    User,
    Mgmt,
}

impl ClusterType {
    /// Number of nodes reserved for coordination and scheduler masters.
    /// Everything else in the cluster is scaled as a worker.
    pub fn reserved_nodes(&self) -> u32 {
        match self {
            ClusterType::User => 4,
            ClusterType::Mgmt => 1,
        }
    }
}

// Desired-state record for a cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub owner: String, // username of the owning user
    pub user_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub endpoint: String,
    pub instances: u32,
    #[serde(default)]
    pub details: String,
    pub status: ClusterStatus,
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,
    pub time_create: DateTime<Utc>,
    pub time_update: DateTime<Utc>,
}

impl Cluster {
    pub fn is_mgmt(&self) -> bool {
        self.cluster_type == ClusterType::Mgmt
    }
}

// One virtual machine of a cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    #[serde(default)]
    pub host_name: String, // empty until the machine exists
    pub cluster_id: ClusterId,
    pub cluster_name: String,
    pub status: HostStatus,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub is_master_node: bool,
    #[serde(default)]
    pub is_slave_node: bool,
    #[serde(default)]
    pub is_swarm_master: bool,
    #[serde(default)]
    pub is_consul: bool,
    #[serde(default)]
    pub is_fullfilled: bool,
    #[serde(default)]
    pub is_dns_server: bool,
    #[serde(default)]
    pub storage_path: String,
    pub user_id: String,
    pub username: String,
    pub tenant_id: String,
    pub time_create: DateTime<Utc>,
    pub time_update: DateTime<Utc>,
}

impl Host {
    /// A host without a hostname never reached the provisioning layer.
    pub fn is_provisioned(&self) -> bool {
        !self.host_name.trim().is_empty()
    }

    /// Provisioning identity used to address the machine for deletion.
    pub fn to_server(&self) -> Server {
        Server {
            hostname: self.host_name.clone(),
            ip_address: self.ip.clone(),
            private_ip_address: self.private_ip.clone(),
            is_master: self.is_master_node,
            is_slave: self.is_slave_node,
            is_swarm_master: self.is_swarm_master,
            storage_path: self.storage_path.clone(),
            is_consul: self.is_consul,
            is_fullfilled: self.is_fullfilled,
            is_dns_server: self.is_dns_server,
        }
    }
}

/// Result of provisioning a single machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Server {
    pub hostname: String,
    pub ip_address: String,
    pub private_ip_address: String,
    pub is_master: bool,
    pub is_slave: bool,
    pub is_swarm_master: bool,
    pub storage_path: String,
    pub is_consul: bool,
    pub is_fullfilled: bool,
    pub is_dns_server: bool,
}

impl Server {
    pub fn is_deployed(&self) -> bool {
        !self.hostname.trim().is_empty()
            && is_valid_ip(&self.ip_address)
            && is_valid_ip(&self.private_ip_address)
            && !self.storage_path.trim().is_empty()
    }
}

pub fn is_valid_ip(value: &str) -> bool {
    value.trim().parse::<IpAddr>().is_ok()
}

// Generic result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;
