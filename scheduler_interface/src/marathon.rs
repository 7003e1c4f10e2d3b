//! HTTP client for a Marathon control plane.

use async_trait::async_trait;
use cluster_shared_types::{Result, ServiceGroup};
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{SchedulerClient, SchedulerError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupAccepted {
    deployment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunningDeployment {
    id: String,
}

/// Talks to `http://{endpoint}/v2/...`.
#[derive(Debug, Clone, Default)]
pub struct MarathonClient {
    client: Client,
}

impl MarathonClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn url(endpoint: &str, path: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{}{}", endpoint, path)
        } else {
            format!("http://{}{}", endpoint, path)
        }
    }

    async fn check(response: Response) -> std::result::Result<Response, SchedulerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(SchedulerError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SchedulerClient for MarathonClient {
    async fn submit_group(&self, group: &ServiceGroup, endpoint: &str) -> Result<String> {
        let response = self
            .client
            .post(Self::url(endpoint, "/v2/groups"))
            .json(group)
            .send()
            .await
            .map_err(|e| SchedulerError::Unreachable {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;
        let accepted: GroupAccepted = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SchedulerError::InvalidResponse(e.to_string()))?;

        info!(
            group = %group.id,
            deployment_id = %accepted.deployment_id,
            "Submitted service group"
        );
        Ok(accepted.deployment_id)
    }

    async fn deployment_done(&self, deployment_id: &str, endpoint: &str) -> Result<bool> {
        let response = self
            .client
            .get(Self::url(endpoint, "/v2/deployments"))
            .send()
            .await
            .map_err(|e| SchedulerError::Unreachable {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;
        let running: Vec<RunningDeployment> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SchedulerError::InvalidResponse(e.to_string()))?;

        // finished deployments drop out of the running list
        let done = running.iter().all(|d| d.id != deployment_id);
        debug!(deployment_id, done, "Deployment status");
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        assert_eq!(
            MarathonClient::url("10.0.0.3:8080", "/v2/groups"),
            "http://10.0.0.3:8080/v2/groups"
        );
        assert_eq!(
            MarathonClient::url("https://marathon.local/", "/v2/deployments"),
            "https://marathon.local/v2/deployments"
        );
    }

    #[test]
    fn test_response_shapes() {
        let accepted: GroupAccepted =
            serde_json::from_str(r#"{"version": "2016-01-01T00:00:00Z", "deploymentId": "d-1"}"#)
                .unwrap();
        assert_eq!(accepted.deployment_id, "d-1");

        let running: Vec<RunningDeployment> =
            serde_json::from_str(r#"[{"id": "d-2", "affectedApps": ["/a"]}]"#).unwrap();
        assert_eq!(running[0].id, "d-2");
    }
}
