//! The deployment module: infrastructure work for each workflow.
//!
//! [`DeployService`] is what the orchestrator talks to. [`Deployer`] does the
//! work in process; [`RemoteDeployer`] forwards it to another instance of
//! this service over HTTP.

use async_trait::async_trait;
use cluster_shared_types::{
    AddNodeRequest, ClusterError, DeleteRequest, DeployRequest, DeployStage, NodeBatch, Result,
    Server,
};

pub mod deployer;
pub mod payloads;
pub mod remote;

pub use deployer::{Deployer, DeployerConfig};
pub use remote::RemoteDeployer;

#[async_trait]
pub trait DeployService: Send + Sync {
    /// Builds a whole cluster and returns its servers in creation order.
    async fn create_cluster(&self, request: &DeployRequest) -> Result<Vec<Server>>;

    /// Removes every listed machine. Fails if any removal failed.
    async fn delete_cluster(&self, request: &DeleteRequest) -> Result<()>;

    /// Adds workers to a running cluster.
    async fn add_nodes(&self, request: &AddNodeRequest) -> Result<NodeBatch>;

    /// Removes the listed workers and returns the ones actually removed.
    async fn delete_nodes(&self, request: &DeleteRequest) -> Result<Vec<Server>>;
}

/// Attributes an error to the step that produced it.
pub(crate) trait StageExt<T> {
    fn stage(self, stage: DeployStage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn stage(self, stage: DeployStage) -> Result<T> {
        self.map_err(|e| match e {
            ClusterError::DeploymentFailed { .. } => e,
            other => ClusterError::deployment(stage, other.to_string()),
        })
    }
}
