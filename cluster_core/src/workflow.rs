//! Supervised execution of deployment workflows.
//!
//! Request handlers submit a [`Workflow`] through a [`WorkflowHandle`] and
//! return immediately. The [`WorkflowRunner`] drains the queue, runs each
//! workflow in its own task under a concurrency limit and records how it
//! ended, so failures and panics are logged instead of lost.

use std::collections::HashMap;
use std::sync::Arc;

use cluster_shared_types::{Cluster, ClusterError, ClusterId, Host, HostId, HostStatus, Result};
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::orchestrator::DeploymentOrchestrator;

pub type WorkflowId = Uuid;

/// Infrastructure change launched after a request has been persisted.
#[derive(Debug, Clone)]
pub enum Workflow {
    CreateCluster {
        cluster: Cluster,
    },
    DeleteCluster {
        cluster: Cluster,
    },
    AddNodes {
        cluster: Cluster,
        hosts: Vec<Host>,
    },
    DeleteNodes {
        cluster: Cluster,
        hosts: Vec<Host>,
        /// Status of each host before it was moved to TERMINATING.
        original: HashMap<HostId, HostStatus>,
    },
}

impl Workflow {
    pub fn name(&self) -> &'static str {
        match self {
            Workflow::CreateCluster { .. } => "create_cluster",
            Workflow::DeleteCluster { .. } => "delete_cluster",
            Workflow::AddNodes { .. } => "add_nodes",
            Workflow::DeleteNodes { .. } => "delete_nodes",
        }
    }

    pub fn cluster(&self) -> &Cluster {
        match self {
            Workflow::CreateCluster { cluster }
            | Workflow::DeleteCluster { cluster }
            | Workflow::AddNodes { cluster, .. }
            | Workflow::DeleteNodes { cluster, .. } => cluster,
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster().id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Succeeded,
    Failed(String),
    Panicked,
}

#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    pub workflow: &'static str,
    pub cluster_id: ClusterId,
    /// `None` while queued or running.
    pub outcome: Option<WorkflowOutcome>,
}

/// Bookkeeping shared by the submit side and the runner.
#[derive(Debug)]
pub struct WorkflowTracker {
    pending: watch::Sender<usize>,
    active: RwLock<HashMap<ClusterId, usize>>,
    records: RwLock<HashMap<WorkflowId, WorkflowRecord>>,
}

impl Default for WorkflowTracker {
    fn default() -> Self {
        Self {
            pending: watch::channel(0).0,
            active: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl WorkflowTracker {
    async fn begin(&self, id: WorkflowId, workflow: &Workflow) {
        let cluster_id = workflow.cluster_id();
        self.records.write().await.insert(
            id,
            WorkflowRecord {
                workflow: workflow.name(),
                cluster_id,
                outcome: None,
            },
        );
        *self.active.write().await.entry(cluster_id).or_insert(0) += 1;
        self.pending.send_modify(|n| *n += 1);
    }

    async fn finish(&self, id: WorkflowId, cluster_id: ClusterId, outcome: WorkflowOutcome) {
        if let Some(record) = self.records.write().await.get_mut(&id) {
            record.outcome = Some(outcome);
        }
        {
            let mut active = self.active.write().await;
            if let Some(count) = active.get_mut(&cluster_id) {
                *count -= 1;
                if *count == 0 {
                    active.remove(&cluster_id);
                }
            }
        }
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub async fn outcome(&self, id: WorkflowId) -> Option<WorkflowOutcome> {
        self.records
            .read()
            .await
            .get(&id)
            .and_then(|r| r.outcome.clone())
    }

    pub async fn record(&self, id: WorkflowId) -> Option<WorkflowRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Clusters with a queued or running workflow.
    pub async fn active_clusters(&self) -> Vec<ClusterId> {
        self.active.read().await.keys().copied().collect()
    }

    pub async fn is_active(&self, cluster_id: ClusterId) -> bool {
        self.active.read().await.contains_key(&cluster_id)
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolves once no workflow is queued or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Submit side of the workflow queue.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    tx: mpsc::Sender<(WorkflowId, Workflow)>,
    tracker: Arc<WorkflowTracker>,
}

/// Receive side of the workflow queue, consumed by [`WorkflowRunner::new`].
#[derive(Debug)]
pub struct WorkflowQueue {
    rx: mpsc::Receiver<(WorkflowId, Workflow)>,
    tracker: Arc<WorkflowTracker>,
}

/// Creates a workflow queue holding up to `capacity` unstarted workflows.
pub fn workflow_queue(capacity: usize) -> (WorkflowHandle, WorkflowQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let tracker = Arc::new(WorkflowTracker::default());
    (
        WorkflowHandle {
            tx,
            tracker: tracker.clone(),
        },
        WorkflowQueue { rx, tracker },
    )
}

impl WorkflowHandle {
    pub async fn submit(&self, workflow: Workflow) -> Result<WorkflowId> {
        let id = Uuid::new_v4();
        let cluster_id = workflow.cluster_id();
        let name = workflow.name();
        self.tracker.begin(id, &workflow).await;
        if self.tx.send((id, workflow)).await.is_err() {
            self.tracker
                .finish(
                    id,
                    cluster_id,
                    WorkflowOutcome::Failed("workflow runner stopped".to_string()),
                )
                .await;
            return Err(ClusterError::InternalError(
                "workflow runner is not running".to_string(),
            ));
        }
        info!(workflow_id = %id, workflow = name, cluster_id = %cluster_id, "Workflow submitted");
        Ok(id)
    }

    pub fn tracker(&self) -> Arc<WorkflowTracker> {
        self.tracker.clone()
    }
}

/// Drains the workflow queue with at most `concurrency` workflows in flight.
pub struct WorkflowRunner {
    orchestrator: Arc<DeploymentOrchestrator>,
    queue: WorkflowQueue,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl WorkflowRunner {
    pub fn new(
        orchestrator: Arc<DeploymentOrchestrator>,
        queue: WorkflowQueue,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            orchestrator,
            queue,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// Runs until every [`WorkflowHandle`] is dropped and the queue is empty.
    pub async fn run(mut self) {
        info!(concurrency = self.concurrency, "Workflow runner starting");
        while let Some((id, workflow)) = self.queue.rx.recv().await {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let orchestrator = self.orchestrator.clone();
            let tracker = self.queue.tracker.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let name = workflow.name();
                let cluster_id = workflow.cluster_id();
                let span = observability::workflow_span!(name, cluster_id);

                // inner task so a panic surfaces as a JoinError
                let task = tokio::spawn(
                    async move { orchestrator.run(workflow).await }.instrument(span),
                );
                let outcome = match task.await {
                    Ok(Ok(())) => {
                        info!(
                            workflow_id = %id,
                            workflow = name,
                            cluster_id = %cluster_id,
                            "Workflow succeeded"
                        );
                        WorkflowOutcome::Succeeded
                    }
                    Ok(Err(e)) => {
                        error!(
                            workflow_id = %id,
                            workflow = name,
                            cluster_id = %cluster_id,
                            error = %e,
                            "Workflow failed"
                        );
                        WorkflowOutcome::Failed(e.to_string())
                    }
                    Err(e) if e.is_panic() => {
                        error!(
                            workflow_id = %id,
                            workflow = name,
                            cluster_id = %cluster_id,
                            "Workflow panicked"
                        );
                        WorkflowOutcome::Panicked
                    }
                    Err(e) => {
                        warn!(
                            workflow_id = %id,
                            workflow = name,
                            error = %e,
                            "Workflow task cancelled"
                        );
                        WorkflowOutcome::Failed(e.to_string())
                    }
                };
                tracker.finish(id, cluster_id, outcome).await;
            });
        }
        info!("Workflow queue closed, runner stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cluster_shared_types::{ClusterType, LifecycleStatus};

    fn cluster() -> Cluster {
        Cluster {
            id: Uuid::new_v4(),
            name: "web".into(),
            owner: "alice".into(),
            user_id: "u-alice".into(),
            tenant_id: "t-1".into(),
            endpoint: String::new(),
            instances: 5,
            details: String::new(),
            status: LifecycleStatus::Deploying,
            cluster_type: ClusterType::User,
            time_create: Utc::now(),
            time_update: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_tracker_counts_active_clusters() {
        let tracker = WorkflowTracker::default();
        let workflow = Workflow::CreateCluster { cluster: cluster() };
        let cluster_id = workflow.cluster_id();
        let id = Uuid::new_v4();

        tracker.begin(id, &workflow).await;
        assert_eq!(tracker.pending(), 1);
        assert!(tracker.is_active(cluster_id).await);
        assert_eq!(tracker.outcome(id).await, None);

        tracker
            .finish(id, cluster_id, WorkflowOutcome::Failed("boom".into()))
            .await;
        assert_eq!(tracker.pending(), 0);
        assert!(tracker.active_clusters().await.is_empty());
        assert_eq!(
            tracker.outcome(id).await,
            Some(WorkflowOutcome::Failed("boom".into()))
        );
        tracker.wait_idle().await;
    }

    #[tokio::test]
    async fn test_submit_without_runner_fails() {
        let (handle, queue) = workflow_queue(4);
        drop(queue);
        let err = handle
            .submit(Workflow::DeleteCluster { cluster: cluster() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InternalError(_)));
        assert_eq!(handle.tracker().pending(), 0);
    }

    #[test]
    fn test_workflow_names() {
        let workflow = Workflow::AddNodes {
            cluster: cluster(),
            hosts: Vec::new(),
        };
        assert_eq!(workflow.name(), "add_nodes");
    }
}
