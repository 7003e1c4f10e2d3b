//! Settles records a workflow left behind in DEPLOYING or TERMINATING.
//!
//! A workflow that dies before writing a final status (a crashed process, a
//! coordination node that never came up) leaves its records transitional
//! forever. The sweeper marks such records FAILED once they have not changed
//! for longer than the configured timeout and no workflow for their cluster
//! is queued or running, which makes them deletable again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cluster_shared_types::{ClusterId, LifecycleStatus, Result};
use state_store_interface::QueryOptions;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{
    Actor, ClusterLifecycle, ClusterQuery, HostLifecycle, HostQuery, StatusFilter,
};
use crate::workflow::WorkflowTracker;

const TRANSITIONAL: [LifecycleStatus; 2] =
    [LifecycleStatus::Deploying, LifecycleStatus::Terminating];

/// Records marked FAILED by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub clusters: usize,
    pub hosts: usize,
}

pub struct StuckRecordSweeper {
    clusters: Arc<ClusterLifecycle>,
    hosts: Arc<HostLifecycle>,
    tracker: Arc<WorkflowTracker>,
    timeout: Duration,
    interval: Duration,
}

impl StuckRecordSweeper {
    /// A zero `timeout` disables the sweeper.
    pub fn new(
        clusters: Arc<ClusterLifecycle>,
        tracker: Arc<WorkflowTracker>,
        timeout: Duration,
    ) -> Self {
        Self {
            hosts: clusters.hosts().clone(),
            clusters,
            tracker,
            timeout,
            interval: (timeout / 2).clamp(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub async fn run(self) {
        if !self.is_enabled() {
            info!("Stuck record sweeper disabled");
            return;
        }
        info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Stuck record sweeper starting"
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) if report == SweepReport::default() => debug!("No stuck records"),
                Ok(report) => info!(
                    clusters = report.clusters,
                    hosts = report.hosts,
                    "Marked stuck records FAILED"
                ),
                Err(e) => error!(error = %e, "Stuck record sweep failed"),
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clusters.now();
        let active: HashSet<ClusterId> = self.tracker.active_clusters().await.into_iter().collect();
        let mut report = SweepReport::default();

        for status in TRANSITIONAL {
            let query = ClusterQuery {
                status: Some(StatusFilter::Is(status)),
                ..Default::default()
            };
            let stuck = self
                .clusters
                .query(&query, &QueryOptions::default(), &Actor::System)
                .await?
                .items
                .into_iter()
                .filter(|c| !active.contains(&c.id) && self.is_stale(c.time_update, now));
            for cluster in stuck {
                warn!(
                    cluster_id = %cluster.id,
                    status = %cluster.status,
                    since = %cluster.time_update,
                    "Cluster stuck, marking FAILED"
                );
                report.hosts += self.fail_hosts(Some(cluster.id), None, now).await?;
                self.clusters
                    .update_status(cluster.id, LifecycleStatus::Failed, &Actor::System)
                    .await?;
                report.clusters += 1;
            }
        }

        // hosts of otherwise settled clusters, e.g. from an interrupted scale operation
        report.hosts += self.fail_hosts(None, Some(&active), now).await?;
        Ok(report)
    }

    /// Marks transitional hosts FAILED. With a cluster given every such host
    /// goes; otherwise only stale hosts of inactive clusters.
    async fn fail_hosts(
        &self,
        cluster_id: Option<ClusterId>,
        active: Option<&HashSet<ClusterId>>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut failed = 0;
        for status in TRANSITIONAL {
            let query = HostQuery {
                cluster_id,
                status: Some(StatusFilter::Is(status)),
            };
            let hosts = self
                .hosts
                .query(&query, &QueryOptions::default(), &Actor::System)
                .await?
                .items;
            for host in hosts {
                if let Some(active) = active {
                    if active.contains(&host.cluster_id) || !self.is_stale(host.time_update, now) {
                        continue;
                    }
                    warn!(
                        host_id = %host.id,
                        cluster_id = %host.cluster_id,
                        status = %host.status,
                        "Host stuck, marking FAILED"
                    );
                }
                self.hosts
                    .update_status(host.id, LifecycleStatus::Failed, &Actor::System)
                    .await?;
                failed += 1;
            }
        }
        Ok(failed)
    }

    fn is_stale(&self, updated: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - updated)
            .to_std()
            .map(|age| age >= self.timeout)
            .unwrap_or(false)
    }
}
