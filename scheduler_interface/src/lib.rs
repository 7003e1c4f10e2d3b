use async_trait::async_trait;
use cluster_shared_types::{ClusterError, Result, ServiceGroup};
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod marathon;
pub mod mock;

pub use marathon::MarathonClient;
pub use mock::MockScheduler;

/// Default number of status queries before a deployment is given up on.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 100;

/// Default pause between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Client for the task scheduler's control plane.
///
/// `endpoint` is `host:port` of the scheduler; a cluster's scheduler is only
/// known once its masters exist, so it is passed per call.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Submits a service group and returns the scheduler's deployment id.
    async fn submit_group(&self, group: &ServiceGroup, endpoint: &str) -> Result<String>;

    /// Whether the deployment has finished.
    async fn deployment_done(&self, deployment_id: &str, endpoint: &str) -> Result<bool>;
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler unreachable at {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("Scheduler rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Unexpected scheduler response: {0}")]
    InvalidResponse(String),
}

impl From<SchedulerError> for ClusterError {
    fn from(err: SchedulerError) -> Self {
        ClusterError::SchedulerError(err.to_string())
    }
}

/// Bounded polling of a scheduler deployment.
#[derive(Debug, Clone, Copy)]
pub struct DeploymentPoller {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for DeploymentPoller {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_POLL_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl DeploymentPoller {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Polls until the deployment is done or the attempt budget runs out.
    ///
    /// Query errors use up an attempt and are otherwise ignored. Returns
    /// `false` when the budget is exhausted; that is a timeout, not a success.
    pub async fn poll_until_done(
        &self,
        client: &dyn SchedulerClient,
        deployment_id: &str,
        endpoint: &str,
    ) -> bool {
        debug!(deployment_id, endpoint, "Waiting for scheduler deployment");
        for attempt in 1..=self.max_attempts {
            match client.deployment_done(deployment_id, endpoint).await {
                Ok(true) => {
                    info!(deployment_id, attempt, "Scheduler deployment finished");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(deployment_id, attempt, error = %e, "Deployment status query failed")
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        warn!(
            deployment_id,
            attempts = self.max_attempts,
            "Scheduler deployment did not finish in time"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(attempts: u32) -> DeploymentPoller {
        DeploymentPoller::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_poll_finishes() {
        let scheduler = MockScheduler::new();
        scheduler.set_polls_until_done(3).await;
        let id = scheduler
            .submit_group(&ServiceGroup::default(), "10.0.0.1:8080")
            .await
            .unwrap();

        assert!(fast(5).poll_until_done(&scheduler, &id, "10.0.0.1:8080").await);
        assert_eq!(scheduler.status_queries(), 3);
    }

    #[tokio::test]
    async fn test_poll_exhausts_budget() {
        let scheduler = MockScheduler::new();
        scheduler.set_polls_until_done(10).await;
        let id = scheduler
            .submit_group(&ServiceGroup::default(), "e")
            .await
            .unwrap();

        assert!(!fast(4).poll_until_done(&scheduler, &id, "e").await);
        assert_eq!(scheduler.status_queries(), 4);
    }

    #[tokio::test]
    async fn test_poll_swallows_query_errors() {
        let scheduler = MockScheduler::new();
        scheduler.fail_status_queries(2).await;
        let id = scheduler
            .submit_group(&ServiceGroup::default(), "e")
            .await
            .unwrap();

        assert!(fast(3).poll_until_done(&scheduler, &id, "e").await);
        assert_eq!(scheduler.status_queries(), 3);
    }

    #[tokio::test]
    async fn test_rejected_group_is_not_recorded() {
        let scheduler = MockScheduler::new();
        scheduler.reject_group("-dns").await;
        let dns = ServiceGroup {
            id: "/alice-web-dns".to_string(),
            ..Default::default()
        };

        assert!(scheduler.submit_group(&dns, "e").await.is_err());
        assert!(scheduler.submit_group(&ServiceGroup::default(), "e").await.is_ok());
        assert_eq!(scheduler.submitted().await.len(), 1);
    }

    #[test]
    fn test_default_budget() {
        let poller = DeploymentPoller::default();
        assert_eq!(poller.max_attempts, 100);
        assert_eq!(poller.interval, Duration::from_secs(30));
    }
}
