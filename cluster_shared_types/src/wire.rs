//! Request and response bodies exchanged with the deployment module.

use serde::{Deserialize, Serialize};

use crate::{ClusterError, DeployStage, Server};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ProviderType {
    #[default]
    #[serde(rename = "openstack")]
    Openstack,
    #[serde(rename = "amazonec2")]
    AmazonEc2,
}

impl ProviderType {
    /// Driver name understood by the provisioning tool.
    pub fn driver(&self) -> &'static str {
        match self {
            ProviderType::Openstack => "openstack",
            ProviderType::AmazonEc2 => "amazonec2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Provider {
    pub provider_type: ProviderType,
    pub ssh_user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenstackInfo {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub tenant_name: String,
    pub flavor_name: String,
    pub image_name: String,
    pub security_group: String,
    pub ip_pool_name: String,
    pub nova_network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsEc2Info {
    pub access_key: String,
    pub secret_key: String,
    pub image_id: String,
    pub instance_type: String,
    pub root_size: String,
    pub region: String,
    pub vpc_id: String,
}

/// Cloud provider and credentials used to create machines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderInfo {
    pub provider: Provider,
    pub openstack_info: OpenstackInfo,
    #[serde(rename = "awsEc2Info")]
    pub aws_ec2_info: AwsEc2Info,
}

/// Create a whole cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(rename = "username")]
    pub user_name: String,
    pub cluster_name: String,
    #[serde(default)]
    pub request_id: String,
    pub cluster_number: u32,
    #[serde(rename = "isLinkerMgmt", default)]
    pub management: bool,
    #[serde(default)]
    pub provider_info: ProviderInfo,
}

/// Add worker nodes to an existing cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddNodeRequest {
    #[serde(rename = "username")]
    pub user_name: String,
    pub cluster_name: String,
    #[serde(default)]
    pub request_id: String,
    pub create_number: u32,
    pub existed_number: u32,
    pub consul_server: String,
    /// Hostname of the swarm leader the composition tool talks to.
    #[serde(default)]
    pub swarm_master: String,
    #[serde(default)]
    pub provider_info: ProviderInfo,
    #[serde(default)]
    pub dns_servers: Vec<Server>,
    #[serde(rename = "isLinkerMgmt", default)]
    pub management: bool,
}

/// Delete a whole cluster or a subset of its nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    #[serde(rename = "username")]
    pub user_name: String,
    pub cluster_name: String,
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFailure {
    pub stage: DeployStage,
    pub message: String,
}

impl From<StageFailure> for ClusterError {
    fn from(failure: StageFailure) -> Self {
        ClusterError::DeploymentFailed {
            stage: failure.stage,
            message: failure.message,
        }
    }
}

/// Outcome of an add-nodes call. Machines that could not be created are
/// absent from `servers`; `failure` is set when a cluster-wide step after
/// machine creation failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeBatch {
    pub requested: u32,
    pub servers: Vec<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_info_from_json() {
        let json = r#"{
            "provider": {"providerType": "amazonec2", "sshUser": "ec2-user"},
            "awsEc2Info": {"accessKey": "AK", "region": "ap-southeast-1"}
        }"#;
        let info: ProviderInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.provider.provider_type, ProviderType::AmazonEc2);
        assert_eq!(info.provider.ssh_user, "ec2-user");
        assert_eq!(info.aws_ec2_info.region, "ap-southeast-1");
        assert!(info.openstack_info.auth_url.is_empty());
    }

    #[test]
    fn test_deploy_request_field_names() {
        let request = DeployRequest {
            user_name: "alice".into(),
            cluster_name: "web".into(),
            request_id: "r-1".into(),
            cluster_number: 5,
            management: true,
            provider_info: ProviderInfo::default(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["username"], "alice");
        assert_eq!(value["clusterName"], "web");
        assert_eq!(value["isLinkerMgmt"], true);
        assert_eq!(value["clusterNumber"], 5);
    }

    #[test]
    fn test_node_batch_failure_is_optional() {
        let batch: NodeBatch = serde_json::from_str(r#"{"requested": 2, "servers": []}"#).unwrap();
        assert!(batch.failure.is_none());

        let err: ClusterError = StageFailure {
            stage: DeployStage::AddNodeCompose,
            message: "compose failed".into(),
        }
        .into();
        assert_eq!(err.stage(), Some(DeployStage::AddNodeCompose));
    }
}
