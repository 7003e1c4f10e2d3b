use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cluster_shared_types::{
    Cluster, ClusterError, ClusterId, ClusterStatus, ClusterType, Host, HostId, HostStatus,
    LifecycleStatus, Result, MGMT_CLUSTER_DETAILS, MGMT_CLUSTER_NAME, MIN_CLUSTER_SIZE,
};
use identity_interface::{Action, IdentityService, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_store_interface::{Collection, Filter, Page, QueryOptions, StateStore, StateStoreExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::hosts::{check_discardable, check_terminable, HostLifecycle, HostQuery};
use super::{
    authorize, scope, status_fields, timestamp, unterminated, validate_cluster_name, Actor,
    StatusFilter, Transition,
};
use crate::workflow::{Workflow, WorkflowHandle};

/// Body of a cluster creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCluster {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub user_id: String,
    pub instances: u32,
    #[serde(default)]
    pub details: String,
    #[serde(rename = "type", default)]
    pub cluster_type: ClusterType,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterQuery {
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<StatusFilter>,
}

impl ClusterQuery {
    fn to_filter(&self) -> Filter {
        let mut filter = Filter::All;
        if let Some(name) = &self.name {
            filter = filter.and(Filter::eq("name", name));
        }
        if let Some(user_id) = &self.user_id {
            filter = filter.and(Filter::eq("user_id", user_id));
        }
        if let Some(status) = self.status {
            filter = filter.and(status.to_filter());
        }
        filter
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Writes made by a scale or delete request, undone when the request
/// cannot be handed to a workflow.
#[derive(Debug, Default)]
struct Applied {
    /// Host id and the status to put back.
    hosts: Vec<(HostId, HostStatus)>,
    instances: i64,
    cluster: Option<ClusterStatus>,
}

/// Owns cluster records and launches the workflows that make them real.
pub struct ClusterLifecycle {
    store: Arc<dyn StateStore>,
    identity: Arc<dyn IdentityService>,
    hosts: Arc<HostLifecycle>,
    workflows: WorkflowHandle,
    // one lock per cluster whose host set is being changed
    scale_locks: Mutex<HashMap<ClusterId, Arc<Mutex<()>>>>,
}

impl ClusterLifecycle {
    pub fn new(
        store: Arc<dyn StateStore>,
        identity: Arc<dyn IdentityService>,
        hosts: Arc<HostLifecycle>,
        workflows: WorkflowHandle,
    ) -> Self {
        Self {
            store,
            identity,
            hosts,
            workflows,
            scale_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn hosts(&self) -> &Arc<HostLifecycle> {
        &self.hosts
    }

    /// Clock the record timestamps are written with.
    pub fn now(&self) -> DateTime<Utc> {
        self.store.now()
    }

    /// Serializes changes to a cluster's host set and instance count.
    async fn lock_cluster(&self, id: ClusterId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.scale_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Puts back what a failed request wrote, logging writes that fail.
    async fn roll_back(&self, id: ClusterId, applied: Applied) {
        for (host_id, status) in applied.hosts {
            if let Err(e) = self
                .hosts
                .update_status(host_id, status, &Actor::System)
                .await
            {
                error!(host_id = %host_id, error = %e, "Failed to restore host status");
            }
        }
        if applied.instances != 0 {
            if let Err(e) = self.apply_instances(id, -applied.instances).await {
                error!(cluster_id = %id, error = %e, "Failed to restore instance count");
            }
        }
        if let Some(status) = applied.cluster {
            if let Err(e) = self.update_status(id, status, &Actor::System).await {
                error!(cluster_id = %id, error = %e, "Failed to restore cluster status");
            }
        }
        warn!(cluster_id = %id, "Request rolled back");
    }

    /// A hostless DEPLOYING host belongs to the add-nodes workflow while one
    /// is queued or running for its cluster.
    async fn check_pending(&self, host: &Host) -> Result<()> {
        if host.status == LifecycleStatus::Deploying
            && self.workflows.tracker().is_active(host.cluster_id).await
        {
            return Err(ClusterError::InvalidState(format!(
                "host {} is still being provisioned",
                host.id
            )));
        }
        Ok(())
    }

    /// Persists a DEPLOYING cluster with one pending host per instance and
    /// launches its creation workflow.
    pub async fn create(&self, request: CreateCluster, actor: &Actor) -> Result<Cluster> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::CreateCluster,
            None,
            ResourceKind::Cluster,
        )
        .await?;
        let token = actor.require_token()?;

        let mut request = request;
        if request.cluster_type == ClusterType::Mgmt {
            if request.name.is_empty() {
                request.name = MGMT_CLUSTER_NAME.to_string();
            }
            if request.details.is_empty() {
                request.details = MGMT_CLUSTER_DETAILS.to_string();
            }
        }
        validate_cluster_name(&request.name)?;
        if request.instances < MIN_CLUSTER_SIZE {
            return Err(ClusterError::Validation(format!(
                "a cluster needs at least {} instances, got {}",
                MIN_CLUSTER_SIZE, request.instances
            )));
        }

        let user = match request.cluster_type {
            ClusterType::User => {
                if request.user_id.trim().is_empty() {
                    return Err(ClusterError::Validation("user_id is required".to_string()));
                }
                self.ensure_name_free(&request.user_id, &request.name).await?;
                self.identity.resolve_user(&request.user_id, token).await?
            }
            ClusterType::Mgmt => {
                let existing = Filter::eq("type", ClusterType::Mgmt).and(unterminated());
                if self
                    .store
                    .find_one::<Cluster>(Collection::Clusters, &existing)
                    .await?
                    .is_some()
                {
                    return Err(ClusterError::Conflict(
                        "a management cluster already exists".to_string(),
                    ));
                }
                self.identity.token_owner(token).await?
            }
        };

        let now = self.store.now();
        let cluster = Cluster {
            id: Uuid::new_v4(),
            name: request.name,
            owner: user.username,
            user_id: user.user_id,
            tenant_id: user.tenant_id,
            endpoint: String::new(),
            instances: request.instances,
            details: request.details,
            status: LifecycleStatus::Deploying,
            cluster_type: request.cluster_type,
            time_create: now,
            time_update: now,
        };
        self.store
            .insert_record(Collection::Clusters, &cluster.id.to_string(), &cluster)
            .await?;
        self.hosts
            .create_pending(&cluster, cluster.instances, actor)
            .await?;
        info!(
            cluster_id = %cluster.id,
            name = %cluster.name,
            instances = cluster.instances,
            cluster_type = ?cluster.cluster_type,
            "Cluster accepted"
        );

        self.workflows
            .submit(Workflow::CreateCluster {
                cluster: cluster.clone(),
            })
            .await?;
        Ok(cluster)
    }

    /// Conflict if the user already has a live cluster with this name.
    async fn ensure_name_free(&self, user_id: &str, name: &str) -> Result<()> {
        let filter = Filter::eq("user_id", user_id)
            .and(Filter::eq("name", name))
            .and(unterminated());
        if self
            .store
            .find_one::<Cluster>(Collection::Clusters, &filter)
            .await?
            .is_some()
        {
            return Err(ClusterError::Conflict(format!(
                "cluster name '{}' is already in use",
                name
            )));
        }
        Ok(())
    }

    /// Checks a prospective cluster name for a user.
    pub async fn check_name(&self, user_id: &str, name: &str, actor: &Actor) -> Result<()> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::GetCluster,
            None,
            ResourceKind::Cluster,
        )
        .await?;
        validate_cluster_name(name)?;
        self.ensure_name_free(user_id, name).await
    }

    pub async fn get(&self, id: ClusterId, actor: &Actor) -> Result<Cluster> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::GetCluster,
            Some(&id.to_string()),
            ResourceKind::Cluster,
        )
        .await?;
        self.load(id, actor, Action::GetCluster).await
    }

    async fn load(&self, id: ClusterId, actor: &Actor, action: Action) -> Result<Cluster> {
        let filter = Filter::eq("id", id).and(scope(self.identity.as_ref(), actor, action).await?);
        self.store
            .find_one(Collection::Clusters, &filter)
            .await?
            .ok_or_else(|| ClusterError::not_found("Cluster", id))
    }

    pub async fn query(
        &self,
        query: &ClusterQuery,
        options: &QueryOptions,
        actor: &Actor,
    ) -> Result<Page<Cluster>> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::GetCluster,
            None,
            ResourceKind::Cluster,
        )
        .await?;
        let filter = query
            .to_filter()
            .and(scope(self.identity.as_ref(), actor, Action::GetCluster).await?);
        self.store
            .query_records(Collection::Clusters, &filter, options)
            .await
    }

    /// The only place a cluster's status changes.
    pub async fn update_status(
        &self,
        id: ClusterId,
        status: ClusterStatus,
        actor: &Actor,
    ) -> Result<Transition> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::UpdateCluster,
            Some(&id.to_string()),
            ResourceKind::Cluster,
        )
        .await?;
        let cluster = self.load(id, actor, Action::UpdateCluster).await?;
        if cluster.status == status {
            return Ok(Transition::Unchanged);
        }
        self.store
            .update_fields(
                Collection::Clusters,
                &Filter::eq("id", id),
                status_fields(status, self.store.now()),
            )
            .await?;
        info!(cluster_id = %id, from = %cluster.status, to = %status, "Cluster status changed");
        Ok(Transition::Applied)
    }

    pub async fn update_fields(
        &self,
        id: ClusterId,
        update: ClusterUpdate,
        actor: &Actor,
    ) -> Result<Cluster> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::UpdateCluster,
            Some(&id.to_string()),
            ResourceKind::Cluster,
        )
        .await?;
        self.load(id, actor, Action::UpdateCluster).await?;

        let mut fields = match serde_json::to_value(&update) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => serde_json::Map::new(),
            Err(e) => return Err(ClusterError::InternalError(e.to_string())),
        };
        fields.insert("time_update".to_string(), timestamp(self.store.now()));
        self.store
            .update_fields(Collection::Clusters, &Filter::eq("id", id), fields)
            .await?;
        self.load(id, actor, Action::UpdateCluster).await
    }

    /// Adds `delta` to the instance count, never going below zero.
    pub async fn adjust_instances(&self, id: ClusterId, delta: i64) -> Result<Cluster> {
        let _guard = self.lock_cluster(id).await;
        self.apply_instances(id, delta).await
    }

    /// [`Self::adjust_instances`] for callers already holding the cluster lock.
    async fn apply_instances(&self, id: ClusterId, delta: i64) -> Result<Cluster> {
        let cluster = self.load(id, &Actor::System, Action::UpdateCluster).await?;
        let instances = (i64::from(cluster.instances) + delta).clamp(0, i64::from(u32::MAX)) as u32;
        if instances == cluster.instances {
            return Ok(cluster);
        }
        self.update_fields(
            id,
            ClusterUpdate {
                instances: Some(instances),
                ..Default::default()
            },
            &Actor::System,
        )
        .await
    }

    /// Starts tearing a cluster down. Hosts that never got a machine are
    /// terminated on the spot; the rest go TERMINATING and are removed by
    /// the delete workflow.
    pub async fn delete(&self, id: ClusterId, actor: &Actor) -> Result<Cluster> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::DeleteCluster,
            Some(&id.to_string()),
            ResourceKind::Cluster,
        )
        .await?;
        let guard = self.lock_cluster(id).await;
        let cluster = self.load(id, actor, Action::DeleteCluster).await?;
        match cluster.status {
            LifecycleStatus::Running | LifecycleStatus::Failed => {}
            LifecycleStatus::Deploying
            | LifecycleStatus::Terminating
            | LifecycleStatus::Terminated => {
                return Err(ClusterError::InvalidState(format!(
                    "cluster {} is {} and cannot be deleted",
                    id, cluster.status
                )));
            }
        }

        let hosts = self.hosts.unterminated_of(id).await?;
        if let Some(busy) = hosts
            .iter()
            .find(|h| h.is_provisioned() && h.status.is_transitional())
        {
            return Err(ClusterError::InvalidState(format!(
                "host {} of cluster {} is {}",
                busy.id, id, busy.status
            )));
        }
        for host in hosts.iter().filter(|h| !h.is_provisioned()) {
            self.check_pending(host).await?;
        }

        let mut applied = Applied::default();
        let written: Result<Cluster> = async {
            let mut direct = 0i64;
            for host in &hosts {
                let target = if host.is_provisioned() {
                    LifecycleStatus::Terminating
                } else {
                    direct += 1;
                    LifecycleStatus::Terminated
                };
                self.hosts
                    .update_status(host.id, target, &Actor::System)
                    .await?;
                applied.hosts.push((host.id, host.status));
            }
            if direct > 0 {
                self.apply_instances(id, -direct).await?;
                applied.instances = -direct;
            }
            self.update_status(id, LifecycleStatus::Terminating, &Actor::System)
                .await?;
            applied.cluster = Some(cluster.status);
            self.load(id, &Actor::System, Action::DeleteCluster).await
        }
        .await;
        let terminating = match written {
            Ok(terminating) => terminating,
            Err(e) => {
                self.roll_back(id, applied).await;
                return Err(e);
            }
        };
        drop(guard);

        info!(cluster_id = %id, unprovisioned = -applied.instances, "Cluster terminating");
        let submitted = self
            .workflows
            .submit(Workflow::DeleteCluster {
                cluster: terminating.clone(),
            })
            .await;
        if let Err(e) = submitted {
            let _guard = self.lock_cluster(id).await;
            self.roll_back(id, applied).await;
            return Err(e);
        }
        Ok(terminating)
    }

    /// Deletes every listed cluster, carrying on past failures.
    pub async fn delete_by_ids(&self, ids: &[ClusterId], actor: &Actor) -> Result<()> {
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.delete(*id, actor).await {
                warn!(cluster_id = %id, error = %e, "Cluster deletion failed");
                errors.push(e);
            }
        }
        batch_result(errors, ids.len())
    }

    /// Deletes every live cluster of a user, carrying on past failures.
    pub async fn delete_by_user(&self, user_id: &str, actor: &Actor) -> Result<()> {
        let query = ClusterQuery {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        };
        let clusters = self
            .query(&query, &QueryOptions::default(), actor)
            .await?
            .items
            .into_iter()
            .filter(|c| {
                !matches!(
                    c.status,
                    LifecycleStatus::Terminating | LifecycleStatus::Terminated
                )
            })
            .map(|c| c.id)
            .collect::<Vec<_>>();
        self.delete_by_ids(&clusters, actor).await
    }

    /// Creates `count` pending hosts on a RUNNING cluster, counts them in
    /// `instances` and launches the add-nodes workflow for them.
    pub async fn add_hosts(
        &self,
        cluster_id: ClusterId,
        count: &str,
        actor: &Actor,
    ) -> Result<Vec<Host>> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::CreateHost,
            Some(&cluster_id.to_string()),
            ResourceKind::Cluster,
        )
        .await?;
        let count = match count.trim().parse::<i64>() {
            Ok(n) if n > 0 && n <= i64::from(u32::MAX) => n as u32,
            _ => {
                return Err(ClusterError::Validation(format!(
                    "host count must be a positive integer, got '{}'",
                    count
                )))
            }
        };
        let guard = self.lock_cluster(cluster_id).await;
        let cluster = self.load(cluster_id, actor, Action::GetCluster).await?;
        require_running(&cluster)?;

        let hosts = self.hosts.create_pending(&cluster, count, actor).await?;
        let mut applied = Applied {
            hosts: hosts
                .iter()
                .map(|h| (h.id, LifecycleStatus::Terminated))
                .collect(),
            ..Default::default()
        };
        if let Err(e) = self.apply_instances(cluster_id, i64::from(count)).await {
            self.roll_back(cluster_id, applied).await;
            return Err(e);
        }
        applied.instances = i64::from(count);
        drop(guard);

        info!(cluster_id = %cluster_id, count, "Adding hosts");
        let submitted = self
            .workflows
            .submit(Workflow::AddNodes {
                cluster,
                hosts: hosts.clone(),
            })
            .await;
        if let Err(e) = submitted {
            let _guard = self.lock_cluster(cluster_id).await;
            self.roll_back(cluster_id, applied).await;
            return Err(e);
        }
        Ok(hosts)
    }

    /// Scales a RUNNING cluster down by the given hosts. Nothing is changed
    /// unless every host may go and enough RUNNING hosts remain.
    pub async fn terminate_hosts(
        &self,
        cluster_id: ClusterId,
        host_ids: &[HostId],
        actor: &Actor,
    ) -> Result<Vec<Host>> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::DeleteHost,
            Some(&cluster_id.to_string()),
            ResourceKind::Cluster,
        )
        .await?;
        if host_ids.is_empty() {
            return Err(ClusterError::Validation("no hosts given".to_string()));
        }
        let guard = self.lock_cluster(cluster_id).await;
        let cluster = self.load(cluster_id, actor, Action::GetCluster).await?;
        require_running(&cluster)?;

        let requested: HashSet<HostId> = host_ids.iter().copied().collect();
        let mut targets = Vec::with_capacity(requested.len());
        for id in &requested {
            let host = self.hosts.get(*id, actor).await?;
            if host.cluster_id != cluster_id {
                return Err(ClusterError::not_found("Host", id));
            }
            targets.push(host);
        }

        let running = self
            .hosts
            .query(
                &HostQuery {
                    cluster_id: Some(cluster_id),
                    status: Some(StatusFilter::Is(LifecycleStatus::Running)),
                },
                &QueryOptions::default(),
                &Actor::System,
            )
            .await?
            .items;
        let remaining = running
            .iter()
            .filter(|h| !requested.contains(&h.id))
            .count();
        if remaining < MIN_CLUSTER_SIZE as usize {
            return Err(ClusterError::InvalidState(format!(
                "cluster {} would keep {} running hosts, at least {} required",
                cluster_id, remaining, MIN_CLUSTER_SIZE
            )));
        }
        for host in &targets {
            if host.is_provisioned() {
                check_terminable(host, false)?;
            } else {
                check_discardable(host)?;
                self.check_pending(host).await?;
            }
        }

        let mut applied = Applied::default();
        let written: Result<Vec<Host>> = async {
            let mut direct = 0i64;
            for host in &targets {
                if host.is_provisioned() {
                    let previous = self.hosts.terminate(host.id, false, &Actor::System).await?;
                    applied.hosts.push((host.id, previous));
                } else {
                    self.hosts
                        .update_status(host.id, LifecycleStatus::Terminated, &Actor::System)
                        .await?;
                    applied.hosts.push((host.id, host.status));
                    direct += 1;
                }
            }
            if direct > 0 {
                self.apply_instances(cluster_id, -direct).await?;
                applied.instances = -direct;
            }
            let mut result = Vec::with_capacity(targets.len());
            for host in &targets {
                result.push(self.hosts.get(host.id, &Actor::System).await?);
            }
            Ok(result)
        }
        .await;
        let result = match written {
            Ok(result) => result,
            Err(e) => {
                self.roll_back(cluster_id, applied).await;
                return Err(e);
            }
        };
        drop(guard);

        let deleting: Vec<Host> = result
            .iter()
            .filter(|h| h.status == LifecycleStatus::Terminating)
            .cloned()
            .collect();
        if deleting.is_empty() {
            return Ok(result);
        }
        let original: HashMap<HostId, HostStatus> = applied
            .hosts
            .iter()
            .filter(|(id, _)| deleting.iter().any(|h| h.id == *id))
            .copied()
            .collect();
        info!(
            cluster_id = %cluster_id,
            count = deleting.len(),
            unprovisioned = -applied.instances,
            "Terminating hosts"
        );
        let submitted = self
            .workflows
            .submit(Workflow::DeleteNodes {
                cluster,
                hosts: deleting,
                original,
            })
            .await;
        if let Err(e) = submitted {
            let _guard = self.lock_cluster(cluster_id).await;
            self.roll_back(cluster_id, applied).await;
            return Err(e);
        }
        Ok(result)
    }
}

fn require_running(cluster: &Cluster) -> Result<()> {
    if cluster.status == LifecycleStatus::Running {
        Ok(())
    } else {
        Err(ClusterError::InvalidState(format!(
            "cluster {} is {}, hosts can only change on a RUNNING cluster",
            cluster.id, cluster.status
        )))
    }
}

fn batch_result(mut errors: Vec<ClusterError>, total: usize) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let failed = errors.len();
    Err(ClusterError::BatchFailed {
        failed,
        total,
        first: Box::new(errors.swap_remove(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::HostUpdate;
    use crate::workflow::workflow_queue;
    use identity_interface::{StaticIdentityService, UserInfo};
    use state_store_interface::in_memory::InMemoryStateStore;

    struct Fixture {
        clusters: ClusterLifecycle,
        store: Arc<InMemoryStateStore>,
        identity: Arc<dyn IdentityService>,
        // keeps submissions succeeding without a runner
        _queue: crate::workflow::WorkflowQueue,
        alice: Actor,
        admin: Actor,
    }

    async fn fixture() -> Fixture {
        let identity = StaticIdentityService::new();
        identity
            .add_user(
                "tok-alice",
                UserInfo {
                    user_id: "u-alice".into(),
                    username: "alice".into(),
                    tenant_id: "t-1".into(),
                    email: "alice@example.com".into(),
                },
                false,
            )
            .await;
        identity
            .add_user(
                "tok-admin",
                UserInfo {
                    user_id: "u-admin".into(),
                    username: "sysadmin".into(),
                    tenant_id: "t-0".into(),
                    email: String::new(),
                },
                true,
            )
            .await;
        let identity: Arc<dyn IdentityService> = Arc::new(identity);
        let store = Arc::new(InMemoryStateStore::new());
        let hosts = Arc::new(HostLifecycle::new(store.clone(), identity.clone()));
        let (handle, queue) = workflow_queue(64);
        Fixture {
            clusters: ClusterLifecycle::new(store.clone(), identity.clone(), hosts, handle),
            store,
            identity,
            _queue: queue,
            alice: Actor::token("tok-alice"),
            admin: Actor::token("tok-admin"),
        }
    }

    impl Fixture {
        /// A RUNNING cluster whose hosts all have machines.
        async fn running(&self, name: &str) -> Cluster {
            let cluster = self
                .clusters
                .create(user_cluster(name, 5), &self.alice)
                .await
                .unwrap();
            let hosts = self.clusters.hosts();
            for (i, host) in hosts.unterminated_of(cluster.id).await.unwrap().iter().enumerate() {
                let update = HostUpdate {
                    host_name: Some(format!("alice.{}.{}", name, i + 1)),
                    is_master_node: Some(i == 1),
                    ..Default::default()
                };
                hosts.update_fields(host.id, update, &Actor::System).await.unwrap();
                hosts
                    .update_status(host.id, LifecycleStatus::Running, &Actor::System)
                    .await
                    .unwrap();
            }
            self.clusters
                .update_status(cluster.id, LifecycleStatus::Running, &Actor::System)
                .await
                .unwrap();
            self.clusters.get(cluster.id, &Actor::System).await.unwrap()
        }

        /// Same records, but nothing drains the workflow queue.
        fn stopped(&self) -> ClusterLifecycle {
            let (handle, queue) = workflow_queue(1);
            drop(queue);
            ClusterLifecycle::new(
                self.store.clone(),
                self.identity.clone(),
                self.clusters.hosts().clone(),
                handle,
            )
        }
    }

    fn user_cluster(name: &str, instances: u32) -> CreateCluster {
        CreateCluster {
            name: name.into(),
            user_id: "u-alice".into(),
            instances,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_persists_pending_records() {
        let f = fixture().await;
        let cluster = f.clusters.create(user_cluster("web", 5), &f.alice).await.unwrap();
        assert_eq!(cluster.status, LifecycleStatus::Deploying);
        assert_eq!(cluster.owner, "alice");
        assert_eq!(cluster.tenant_id, "t-1");
        assert_eq!(f.store.count(Collection::Hosts).await, 5);
    }

    #[tokio::test]
    async fn test_create_rejects_small_cluster_without_writes() {
        let f = fixture().await;
        let err = f
            .clusters
            .create(user_cluster("web", 4), &f.alice)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)));
        assert_eq!(f.store.count(Collection::Clusters).await, 0);
        assert_eq!(f.store.count(Collection::Hosts).await, 0);
    }

    #[tokio::test]
    async fn test_create_requires_user_for_user_clusters() {
        let f = fixture().await;
        let mut request = user_cluster("web", 5);
        request.user_id.clear();
        assert!(f.clusters.create(request, &f.alice).await.is_err());
        assert!(f
            .clusters
            .create(user_cluster("bad name", 5), &f.alice)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_name_reuse_after_termination() {
        let f = fixture().await;
        let first = f.clusters.create(user_cluster("web", 5), &f.alice).await.unwrap();

        let err = f
            .clusters
            .create(user_cluster("web", 5), &f.alice)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert!(f.clusters.check_name("u-alice", "web", &f.alice).await.is_err());

        f.clusters
            .update_status(first.id, LifecycleStatus::Terminated, &Actor::System)
            .await
            .unwrap();
        f.clusters.check_name("u-alice", "web", &f.alice).await.unwrap();
        f.clusters.create(user_cluster("web", 5), &f.alice).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_management_cluster() {
        let f = fixture().await;
        let request = CreateCluster {
            instances: 5,
            cluster_type: ClusterType::Mgmt,
            ..Default::default()
        };
        let mgmt = f.clusters.create(request.clone(), &f.admin).await.unwrap();
        assert_eq!(mgmt.name, MGMT_CLUSTER_NAME);
        assert_eq!(mgmt.details, MGMT_CLUSTER_DETAILS);
        assert_eq!(mgmt.owner, "sysadmin");

        let err = f.clusters.create(request, &f.admin).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_status_reports_unchanged() {
        let f = fixture().await;
        let cluster = f.clusters.create(user_cluster("web", 5), &f.alice).await.unwrap();
        let result = f
            .clusters
            .update_status(cluster.id, LifecycleStatus::Deploying, &f.alice)
            .await
            .unwrap();
        assert_eq!(result, Transition::Unchanged);
        let stored = f.clusters.get(cluster.id, &f.alice).await.unwrap();
        assert_eq!(stored.time_update, cluster.time_update);
    }

    #[tokio::test]
    async fn test_delete_rejects_deploying_cluster() {
        let f = fixture().await;
        let cluster = f.clusters.create(user_cluster("web", 5), &f.alice).await.unwrap();
        let err = f.clusters.delete(cluster.id, &f.alice).await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidState(_)));
        let stored = f.clusters.get(cluster.id, &f.alice).await.unwrap();
        assert_eq!(stored, cluster);
    }

    #[tokio::test]
    async fn test_batch_delete_reports_aggregate_failure() {
        let f = fixture().await;
        let deploying = f.clusters.create(user_cluster("a", 5), &f.alice).await.unwrap();
        let err = f
            .clusters
            .delete_by_ids(&[deploying.id, Uuid::new_v4()], &f.alice)
            .await
            .unwrap_err();
        match err {
            ClusterError::BatchFailed { failed, total, .. } => {
                assert_eq!((failed, total), (2, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_add_hosts_validates_count() {
        let f = fixture().await;
        let cluster = f.clusters.create(user_cluster("web", 5), &f.alice).await.unwrap();
        for bad in ["0", "-2", "three", ""] {
            let err = f
                .clusters
                .add_hosts(cluster.id, bad, &f.alice)
                .await
                .unwrap_err();
            assert!(matches!(err, ClusterError::Validation(_)), "{bad}");
        }
        // valid count, but the cluster is still deploying
        let err = f
            .clusters
            .add_hosts(cluster.id, "2", &f.alice)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_add_hosts_counts_pending_hosts() {
        let f = fixture().await;
        let cluster = f.running("web").await;
        let added = f.clusters.add_hosts(cluster.id, "2", &f.alice).await.unwrap();
        assert_eq!(added.len(), 2);

        let stored = f.clusters.get(cluster.id, &f.alice).await.unwrap();
        let live = f.clusters.hosts().unterminated_of(cluster.id).await.unwrap();
        assert_eq!(stored.instances, 7);
        assert_eq!(live.len(), 7);
    }

    #[tokio::test]
    async fn test_stopped_runner_rolls_back_scale_down() {
        let f = fixture().await;
        let cluster = f.running("web").await;
        let extra = f.clusters.add_hosts(cluster.id, "1", &f.alice).await.unwrap();
        let hosts = f.clusters.hosts();
        hosts
            .update_fields(
                extra[0].id,
                HostUpdate {
                    host_name: Some("alice.web.6".into()),
                    ..Default::default()
                },
                &Actor::System,
            )
            .await
            .unwrap();
        hosts
            .update_status(extra[0].id, LifecycleStatus::Running, &Actor::System)
            .await
            .unwrap();

        let stopped = f.stopped();
        assert!(stopped
            .terminate_hosts(cluster.id, &[extra[0].id], &f.alice)
            .await
            .is_err());
        let host = hosts.get(extra[0].id, &Actor::System).await.unwrap();
        assert_eq!(host.status, LifecycleStatus::Running);
        let stored = f.clusters.get(cluster.id, &f.alice).await.unwrap();
        assert_eq!(stored.instances, 6);
        assert_eq!(stored.status, LifecycleStatus::Running);
    }

    #[tokio::test]
    async fn test_stopped_runner_rolls_back_add_and_delete() {
        let f = fixture().await;
        let cluster = f.running("web").await;
        let stopped = f.stopped();

        assert!(stopped.add_hosts(cluster.id, "2", &f.alice).await.is_err());
        let live = f.clusters.hosts().unterminated_of(cluster.id).await.unwrap();
        assert_eq!(live.len(), 5);
        assert_eq!(f.clusters.get(cluster.id, &f.alice).await.unwrap().instances, 5);

        assert!(stopped.delete(cluster.id, &f.alice).await.is_err());
        let stored = f.clusters.get(cluster.id, &f.alice).await.unwrap();
        assert_eq!(stored.status, LifecycleStatus::Running);
        assert_eq!(stored.instances, 5);
        let live = f.clusters.hosts().unterminated_of(cluster.id).await.unwrap();
        assert!(live.iter().all(|h| h.status == LifecycleStatus::Running));
    }
}
