//! Cluster lifecycle management: records, deployment workflows and the
//! deployment module that builds clusters on cloud machines.
//!
//! [`start_cluster_service`] wires the pieces together: requests go through
//! [`lifecycle::ClusterLifecycle`], which persists records and queues a
//! [`workflow::Workflow`]; the [`workflow::WorkflowRunner`] hands each one to
//! the [`orchestrator::DeploymentOrchestrator`], which calls the
//! [`deploy::DeployService`] and writes the outcome back.

#[cfg(feature = "rest-api")]
pub mod api;

pub mod config;
pub mod deploy;
pub mod lifecycle;
pub mod orchestrator;
pub mod reconciliation;
pub mod topology;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use cluster_shared_types::ProviderInfo;
use identity_interface::IdentityService;
use state_store_interface::StateStore;
use tokio::task::JoinHandle;
use tracing::info;

use deploy::DeployService;
use lifecycle::{ClusterLifecycle, HostLifecycle};
use orchestrator::DeploymentOrchestrator;
use reconciliation::StuckRecordSweeper;
use workflow::{workflow_queue, WorkflowRunner, WorkflowTracker};

/// Runtime settings for [`start_cluster_service`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Provider used for machines of new clusters and hosts.
    pub provider: ProviderInfo,
    pub workflow_concurrency: usize,
    /// Unstarted workflows held before submission waits.
    pub queue_capacity: usize,
    /// Zero disables the stuck record sweeper.
    pub stuck_record_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            provider: ProviderInfo::default(),
            workflow_concurrency: 8,
            queue_capacity: 256,
            stuck_record_timeout: Duration::ZERO,
        }
    }
}

impl From<&config::ServiceConfig> for ServiceOptions {
    fn from(config: &config::ServiceConfig) -> Self {
        Self {
            workflow_concurrency: config.workflow_concurrency,
            stuck_record_timeout: config.stuck_record_timeout,
            ..Default::default()
        }
    }
}

/// A running cluster service: lifecycle front plus background tasks.
pub struct ClusterService {
    pub store: Arc<dyn StateStore>,
    pub identity: Arc<dyn IdentityService>,
    pub deployer: Arc<dyn DeployService>,
    pub clusters: Arc<ClusterLifecycle>,
    pub tracker: Arc<WorkflowTracker>,
    runner: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
}

impl ClusterService {
    pub fn hosts(&self) -> &Arc<HostLifecycle> {
        self.clusters.hosts()
    }

    /// Stops the background tasks. Queued workflows are dropped.
    pub fn shutdown(&self) {
        self.runner.abort();
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
    }
}

/// Builds the lifecycle and spawns the workflow runner, plus the stuck
/// record sweeper when enabled. Must be called inside a tokio runtime.
pub fn start_cluster_service(
    store: Arc<dyn StateStore>,
    identity: Arc<dyn IdentityService>,
    deployer: Arc<dyn DeployService>,
    options: ServiceOptions,
) -> ClusterService {
    let (handle, queue) = workflow_queue(options.queue_capacity);
    let tracker = handle.tracker();
    let hosts = Arc::new(HostLifecycle::new(store.clone(), identity.clone()));
    let clusters = Arc::new(ClusterLifecycle::new(
        store.clone(),
        identity.clone(),
        hosts,
        handle,
    ));

    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        clusters.clone(),
        deployer.clone(),
        options.provider,
    ));
    let runner = tokio::spawn(
        WorkflowRunner::new(orchestrator, queue, options.workflow_concurrency).run(),
    );

    let sweeper = StuckRecordSweeper::new(
        clusters.clone(),
        tracker.clone(),
        options.stuck_record_timeout,
    );
    let sweeper = sweeper.is_enabled().then(|| tokio::spawn(sweeper.run()));
    info!(
        concurrency = options.workflow_concurrency,
        sweeper = sweeper.is_some(),
        "Cluster service started"
    );

    ClusterService {
        store,
        identity,
        deployer,
        clusters,
        tracker,
        runner,
        sweeper,
    }
}
