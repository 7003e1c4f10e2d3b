//! Client for a deployment module running in another process.

use async_trait::async_trait;
use cluster_shared_types::{
    AddNodeRequest, ClusterError, DeleteRequest, DeployRequest, DeployStage, NodeBatch, Result,
    Server,
};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::DeployService;

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: String,
    message: String,
    #[serde(default)]
    stage: Option<DeployStage>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<RemoteError>,
}

impl From<RemoteError> for ClusterError {
    fn from(err: RemoteError) -> Self {
        match (err.stage, err.code.as_str()) {
            (Some(stage), _) => ClusterError::deployment(stage, err.message),
            (None, "VALIDATION_ERROR") => ClusterError::Validation(err.message),
            (None, _) => ClusterError::ProvisioningError(format!("{}: {}", err.code, err.message)),
        }
    }
}

/// Calls `{base_url}/v1/deploy` and `{base_url}/v1/deploy/nodes`.
#[derive(Debug, Clone)]
pub struct RemoteDeployer {
    client: Client,
    base_url: String,
}

impl RemoteDeployer {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, url = %url, "Calling deployment module");
        let response = self
            .client
            .request(method, &url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                ClusterError::ProvisioningError(format!("deployment module unreachable: {}", e))
            })?;
        let status = response.status();
        let envelope: Envelope = response.json().await.map_err(|e| {
            ClusterError::ProvisioningError(format!(
                "unexpected deployment module response ({}): {}",
                status, e
            ))
        })?;

        if !envelope.success {
            return Err(match envelope.error {
                Some(err) => err.into(),
                None => ClusterError::ProvisioningError(format!(
                    "deployment module failed with {}",
                    status
                )),
            });
        }
        serde_json::from_value(envelope.data)
            .map_err(|e| ClusterError::ProvisioningError(format!("invalid response data: {}", e)))
    }
}

#[async_trait]
impl DeployService for RemoteDeployer {
    async fn create_cluster(&self, request: &DeployRequest) -> Result<Vec<Server>> {
        self.call(Method::POST, "/v1/deploy", request).await
    }

    async fn delete_cluster(&self, request: &DeleteRequest) -> Result<()> {
        self.call(Method::DELETE, "/v1/deploy", request).await
    }

    async fn add_nodes(&self, request: &AddNodeRequest) -> Result<NodeBatch> {
        self.call(Method::POST, "/v1/deploy/nodes", request).await
    }

    async fn delete_nodes(&self, request: &DeleteRequest) -> Result<Vec<Server>> {
        self.call(Method::DELETE, "/v1/deploy/nodes", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_mapping() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"success": false, "error": {"code": "DEPLOYMENT_ERROR", "message": "ssh failed", "stage": "nameserver"}}"#,
        )
        .unwrap();
        let err: ClusterError = envelope.error.unwrap().into();
        assert_eq!(err.stage(), Some(DeployStage::Nameserver));

        let err: ClusterError = RemoteError {
            code: "VALIDATION_ERROR".into(),
            message: "too small".into(),
            stage: None,
        }
        .into();
        assert!(matches!(err, ClusterError::Validation(_)));
    }

    #[test]
    fn test_unit_data_from_null() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"success": true, "data": null}"#).unwrap();
        let unit: () = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(unit, ());

        let envelope: Envelope = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(envelope.data.is_null());
    }

    #[test]
    fn test_base_url_trimmed() {
        let remote = RemoteDeployer::new("http://deploy:10003/");
        assert_eq!(remote.base_url, "http://deploy:10003");
    }
}
