//! Mock scheduler for testing.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cluster_shared_types::{Result, ServiceGroup};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{SchedulerClient, SchedulerError};

#[derive(Debug)]
struct Behaviour {
    /// Successful status queries needed before a deployment reports done.
    polls_until_done: u32,
    /// Leading status queries that fail.
    failing_queries: u32,
    /// Groups whose id contains one of these fragments are rejected.
    rejected_groups: Vec<String>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            polls_until_done: 1,
            failing_queries: 0,
            rejected_groups: Vec::new(),
        }
    }
}

/// Scheduler that accepts groups in memory.
#[derive(Debug, Default)]
pub struct MockScheduler {
    submitted: Arc<RwLock<Vec<(ServiceGroup, String)>>>,
    behaviour: Arc<RwLock<Behaviour>>,
    queries: AtomicUsize,
    successful_queries: AtomicU32,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_polls_until_done(&self, polls: u32) {
        self.behaviour.write().await.polls_until_done = polls;
    }

    /// Deployments never finish.
    pub async fn never_finish(&self) {
        self.set_polls_until_done(u32::MAX).await;
    }

    pub async fn fail_status_queries(&self, count: u32) {
        self.behaviour.write().await.failing_queries = count;
    }

    /// Reject submission of any group whose id contains `fragment`.
    pub async fn reject_group(&self, fragment: &str) {
        self.behaviour
            .write()
            .await
            .rejected_groups
            .push(fragment.to_string());
    }

    /// `(group, endpoint)` pairs accepted so far (for testing).
    pub async fn submitted(&self) -> Vec<(ServiceGroup, String)> {
        self.submitted.read().await.clone()
    }

    /// Total status queries, failed ones included.
    pub fn status_queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn submit_group(&self, group: &ServiceGroup, endpoint: &str) -> Result<String> {
        let rejected = self
            .behaviour
            .read()
            .await
            .rejected_groups
            .iter()
            .any(|fragment| group.id.contains(fragment.as_str()));
        if rejected {
            return Err(SchedulerError::Rejected {
                status: 409,
                message: format!("group {} rejected", group.id),
            }
            .into());
        }

        let mut submitted = self.submitted.write().await;
        submitted.push((group.clone(), endpoint.to_string()));
        let deployment_id = format!("mock-deployment-{}", submitted.len());
        debug!("MockScheduler: accepted {} as {}", group.id, deployment_id);
        Ok(deployment_id)
    }

    async fn deployment_done(&self, _deployment_id: &str, endpoint: &str) -> Result<bool> {
        let query = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
        let behaviour = self.behaviour.read().await;
        if query <= behaviour.failing_queries as usize {
            return Err(SchedulerError::Unreachable {
                endpoint: endpoint.to_string(),
                message: "injected query failure".to_string(),
            }
            .into());
        }
        let successful = self.successful_queries.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(successful >= behaviour.polls_until_done)
    }
}
