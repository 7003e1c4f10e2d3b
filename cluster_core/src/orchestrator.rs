//! Drives each workflow through the deployment module and writes the result
//! back onto the cluster and host records.
//!
//! A workflow never retries a failed step. Failures end in FAILED records,
//! except for DeleteNodes, which restores every host to the status it had
//! before the request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cluster_shared_types::{
    AddNodeRequest, Cluster, ClusterError, DeleteRequest, DeployRequest, DeployStage, Host, HostId,
    HostStatus, LifecycleStatus, ProviderInfo, Result, Server,
};
use state_store_interface::QueryOptions;
use tracing::{error, info, warn};

use crate::deploy::DeployService;
use crate::lifecycle::{
    Actor, ClusterLifecycle, ClusterUpdate, HostLifecycle, HostQuery, HostUpdate, StatusFilter,
};
use crate::workflow::Workflow;

pub struct DeploymentOrchestrator {
    clusters: Arc<ClusterLifecycle>,
    hosts: Arc<HostLifecycle>,
    deployer: Arc<dyn DeployService>,
    provider: ProviderInfo,
}

impl DeploymentOrchestrator {
    pub fn new(
        clusters: Arc<ClusterLifecycle>,
        deployer: Arc<dyn DeployService>,
        provider: ProviderInfo,
    ) -> Self {
        Self {
            hosts: clusters.hosts().clone(),
            clusters,
            deployer,
            provider,
        }
    }

    pub async fn run(&self, workflow: Workflow) -> Result<()> {
        match workflow {
            Workflow::CreateCluster { cluster } => self.create_cluster(&cluster).await,
            Workflow::DeleteCluster { cluster } => self.delete_cluster(&cluster).await,
            Workflow::AddNodes { cluster, hosts } => self.add_nodes(&cluster, &hosts).await,
            Workflow::DeleteNodes {
                cluster,
                hosts,
                original,
            } => self.delete_nodes(&cluster, &hosts, &original).await,
        }
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let request = DeployRequest {
            user_name: cluster.owner.clone(),
            cluster_name: cluster.name.clone(),
            request_id: cluster.id.to_string(),
            cluster_number: cluster.instances,
            management: cluster.is_mgmt(),
            provider_info: self.provider.clone(),
        };
        info!(
            cluster_id = %cluster.id,
            instances = cluster.instances,
            "Creating cluster infrastructure"
        );

        let servers = match self.deployer.create_cluster(&request).await {
            Ok(servers) => servers,
            Err(e) if e.stage() == Some(DeployStage::CoordinationNode) => {
                // nothing exists yet; the stuck-record sweeper settles the records
                warn!(
                    cluster_id = %cluster.id,
                    error = %e,
                    "Coordination node failed, cluster left DEPLOYING"
                );
                return Err(e);
            }
            Err(e) => {
                self.fail_cluster(cluster).await;
                return Err(e);
            }
        };

        if let Err(e) = self.finish_create(cluster, &servers).await {
            self.fail_cluster(cluster).await;
            return Err(e);
        }
        Ok(())
    }

    /// Copies the provisioning results onto the host records in creation
    /// order and marks everything RUNNING.
    async fn finish_create(&self, cluster: &Cluster, servers: &[Server]) -> Result<()> {
        let hosts = self.hosts.unterminated_of(cluster.id).await?;
        if hosts.len() != servers.len() {
            return Err(ClusterError::InternalError(format!(
                "cluster {} has {} hosts but {} servers were deployed",
                cluster.id,
                hosts.len(),
                servers.len()
            )));
        }
        if let Some(server) = servers.iter().find(|s| !s.is_deployed()) {
            return Err(ClusterError::ProvisioningError(format!(
                "server '{}' is not fully deployed",
                server.hostname
            )));
        }

        for (host, server) in hosts.iter().zip(servers) {
            self.hosts
                .update_fields(host.id, HostUpdate::from_server(server), &Actor::System)
                .await?;
            self.hosts
                .update_status(host.id, LifecycleStatus::Running, &Actor::System)
                .await?;
        }

        let endpoint = servers
            .iter()
            .find(|s| s.is_dns_server)
            .map(|s| s.ip_address.clone())
            .unwrap_or_default();
        if endpoint.is_empty() {
            warn!(
                cluster_id = %cluster.id,
                "No DNS server among deployed servers, endpoint left empty"
            );
        }
        self.clusters
            .update_fields(
                cluster.id,
                ClusterUpdate {
                    endpoint: Some(endpoint.clone()),
                    ..Default::default()
                },
                &Actor::System,
            )
            .await?;
        self.clusters
            .update_status(cluster.id, LifecycleStatus::Running, &Actor::System)
            .await?;
        info!(cluster_id = %cluster.id, endpoint = %endpoint, "Cluster running");
        Ok(())
    }

    /// Best effort: every live host and the cluster go FAILED.
    async fn fail_cluster(&self, cluster: &Cluster) {
        match self.hosts.mark_all(cluster.id, LifecycleStatus::Failed).await {
            Ok(0) => {}
            Ok(failed) => {
                warn!(cluster_id = %cluster.id, failed, "Some hosts could not be marked FAILED")
            }
            Err(e) => {
                warn!(cluster_id = %cluster.id, error = %e, "Failed to list hosts to mark FAILED")
            }
        }
        if let Err(e) = self
            .clusters
            .update_status(cluster.id, LifecycleStatus::Failed, &Actor::System)
            .await
        {
            error!(cluster_id = %cluster.id, error = %e, "Failed to mark cluster FAILED");
        }
    }

    async fn delete_cluster(&self, cluster: &Cluster) -> Result<()> {
        let hosts = self.hosts.unterminated_of(cluster.id).await?;
        if hosts.is_empty() {
            info!(cluster_id = %cluster.id, "No machines left, cluster terminated");
            self.clusters
                .update_status(cluster.id, LifecycleStatus::Terminated, &Actor::System)
                .await?;
            return Ok(());
        }

        let request = DeleteRequest {
            user_name: cluster.owner.clone(),
            cluster_name: cluster.name.clone(),
            servers: hosts.iter().map(Host::to_server).collect(),
        };
        info!(cluster_id = %cluster.id, machines = hosts.len(), "Deleting cluster infrastructure");
        if let Err(e) = self.deployer.delete_cluster(&request).await {
            self.fail_cluster(cluster).await;
            return Err(e);
        }

        let failed = self
            .hosts
            .mark_all(cluster.id, LifecycleStatus::Terminated)
            .await?;
        if failed > 0 {
            warn!(cluster_id = %cluster.id, failed, "Some hosts could not be marked TERMINATED");
        }
        self.clusters
            .update_fields(
                cluster.id,
                ClusterUpdate {
                    instances: Some(0),
                    ..Default::default()
                },
                &Actor::System,
            )
            .await?;
        self.clusters
            .update_status(cluster.id, LifecycleStatus::Terminated, &Actor::System)
            .await?;
        info!(cluster_id = %cluster.id, "Cluster terminated");
        Ok(())
    }

    async fn add_nodes(&self, cluster: &Cluster, new_hosts: &[Host]) -> Result<()> {
        let current = self.clusters.get(cluster.id, &Actor::System).await?;
        let fresh: HashSet<HostId> = new_hosts.iter().map(|h| h.id).collect();
        let existing: Vec<Host> = self
            .hosts
            .query(
                &HostQuery {
                    cluster_id: Some(cluster.id),
                    status: Some(StatusFilter::Is(LifecycleStatus::Running)),
                },
                &QueryOptions::default(),
                &Actor::System,
            )
            .await?
            .items
            .into_iter()
            .filter(|h| h.is_provisioned() && !fresh.contains(&h.id))
            .collect();

        let host_name_of = |pick: fn(&Host) -> bool| {
            existing
                .iter()
                .find(|h| pick(h))
                .map(|h| h.host_name.clone())
                .unwrap_or_default()
        };
        let request = AddNodeRequest {
            user_name: cluster.owner.clone(),
            cluster_name: cluster.name.clone(),
            request_id: cluster.id.to_string(),
            create_number: new_hosts.len() as u32,
            // the new hosts are already counted in `instances`
            existed_number: current.instances.saturating_sub(new_hosts.len() as u32),
            consul_server: host_name_of(|h| h.is_consul),
            swarm_master: host_name_of(|h| h.is_swarm_master),
            provider_info: self.provider.clone(),
            dns_servers: existing
                .iter()
                .filter(|h| h.is_dns_server)
                .map(Host::to_server)
                .collect(),
            management: cluster.is_mgmt(),
        };
        info!(
            cluster_id = %cluster.id,
            count = request.create_number,
            existing = request.existed_number,
            "Adding nodes"
        );

        let (servers, failure) = match self.deployer.add_nodes(&request).await {
            Ok(batch) => (batch.servers, batch.failure.map(ClusterError::from)),
            Err(e) => (Vec::new(), Some(e)),
        };
        let failure = failure.or_else(|| {
            servers.is_empty().then(|| {
                ClusterError::deployment(DeployStage::AddNodeMachine, "no machine was created")
            })
        });

        if let Some(e) = failure {
            // machines that do exist keep their identity so they can be deleted
            for (host, server) in new_hosts.iter().zip(&servers) {
                if let Err(err) = self
                    .hosts
                    .update_fields(host.id, HostUpdate::identity_of(server), &Actor::System)
                    .await
                {
                    warn!(
                        host_id = %host.id,
                        error = %err,
                        "Failed to record machine of failed host"
                    );
                }
            }
            self.mark_hosts(new_hosts, LifecycleStatus::Failed).await;
            self.clusters
                .update_status(cluster.id, LifecycleStatus::Running, &Actor::System)
                .await?;
            return Err(e);
        }

        for (i, host) in new_hosts.iter().enumerate() {
            match servers.get(i) {
                Some(server) => {
                    self.hosts
                        .update_fields(host.id, HostUpdate::from_server(server), &Actor::System)
                        .await?;
                    self.hosts
                        .update_status(host.id, LifecycleStatus::Running, &Actor::System)
                        .await?;
                }
                None => {
                    self.hosts
                        .update_status(host.id, LifecycleStatus::Failed, &Actor::System)
                        .await?;
                }
            }
        }
        // failed hosts stay counted until they are terminated
        let added = servers.len().min(new_hosts.len());
        self.clusters
            .update_status(cluster.id, LifecycleStatus::Running, &Actor::System)
            .await?;
        info!(cluster_id = %cluster.id, added, failed = new_hosts.len() - added, "Nodes added");

        if added < new_hosts.len() {
            return Err(ClusterError::BatchFailed {
                failed: new_hosts.len() - added,
                total: new_hosts.len(),
                first: Box::new(ClusterError::deployment(
                    DeployStage::AddNodeMachine,
                    "machine creation failed",
                )),
            });
        }
        Ok(())
    }

    async fn delete_nodes(
        &self,
        cluster: &Cluster,
        hosts: &[Host],
        original: &HashMap<HostId, HostStatus>,
    ) -> Result<()> {
        let request = DeleteRequest {
            user_name: cluster.owner.clone(),
            cluster_name: cluster.name.clone(),
            servers: hosts.iter().map(Host::to_server).collect(),
        };
        info!(cluster_id = %cluster.id, count = hosts.len(), "Deleting nodes");

        let confirmed = match self.deployer.delete_nodes(&request).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(
                    cluster_id = %cluster.id,
                    error = %e,
                    "Node deletion failed, restoring host status"
                );
                for host in hosts {
                    let previous = original
                        .get(&host.id)
                        .copied()
                        .unwrap_or(LifecycleStatus::Running);
                    if let Err(err) = self
                        .hosts
                        .update_status(host.id, previous, &Actor::System)
                        .await
                    {
                        error!(host_id = %host.id, error = %err, "Failed to restore host status");
                    }
                }
                self.clusters
                    .update_status(cluster.id, LifecycleStatus::Running, &Actor::System)
                    .await?;
                return Err(e);
            }
        };

        let removed: HashSet<&str> = confirmed.iter().map(|s| s.hostname.as_str()).collect();
        let mut deleted = 0usize;
        let mut missing = Vec::new();
        for host in hosts {
            if removed.contains(host.host_name.as_str()) {
                self.hosts
                    .update_status(host.id, LifecycleStatus::Terminated, &Actor::System)
                    .await?;
                deleted += 1;
            } else {
                self.hosts
                    .update_status(host.id, LifecycleStatus::Failed, &Actor::System)
                    .await?;
                missing.push(host.host_name.clone());
            }
        }
        let updated = self
            .clusters
            .adjust_instances(cluster.id, -(deleted as i64))
            .await?;
        self.clusters
            .update_status(cluster.id, LifecycleStatus::Running, &Actor::System)
            .await?;
        info!(cluster_id = %cluster.id, deleted, instances = updated.instances, "Nodes deleted");

        match missing.first() {
            None => Ok(()),
            Some(first) => Err(ClusterError::BatchFailed {
                failed: missing.len(),
                total: hosts.len(),
                first: Box::new(ClusterError::deployment(
                    DeployStage::DeleteNode,
                    format!("machine {} was not removed", first),
                )),
            }),
        }
    }

    async fn mark_hosts(&self, hosts: &[Host], status: HostStatus) {
        for host in hosts {
            if let Err(e) = self
                .hosts
                .update_status(host.id, status, &Actor::System)
                .await
            {
                warn!(host_id = %host.id, error = %e, "Failed to update host status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{workflow_queue, WorkflowQueue};
    use crate::lifecycle::CreateCluster;
    use async_trait::async_trait;
    use cluster_shared_types::{ClusterId, NodeBatch};
    use identity_interface::{IdentityService, StaticIdentityService, UserInfo};
    use state_store_interface::in_memory::InMemoryStateStore;
    use std::sync::Mutex;

    enum Script {
        Servers(Vec<Server>),
        Batch(NodeBatch),
        Fail(DeployStage),
    }

    #[derive(Default)]
    struct Scripted {
        next: Mutex<Vec<Script>>,
        last_add: Mutex<Option<AddNodeRequest>>,
    }

    impl Scripted {
        fn push(&self, script: Script) {
            self.next.lock().unwrap().push(script);
        }

        fn take(&self) -> Result<Script> {
            let mut next = self.next.lock().unwrap();
            if next.is_empty() {
                return Err(ClusterError::InternalError("nothing scripted".into()));
            }
            match next.remove(0) {
                Script::Fail(stage) => Err(ClusterError::deployment(stage, "scripted failure")),
                other => Ok(other),
            }
        }
    }

    #[async_trait]
    impl DeployService for Scripted {
        async fn create_cluster(&self, _request: &DeployRequest) -> Result<Vec<Server>> {
            match self.take()? {
                Script::Servers(servers) => Ok(servers),
                _ => Err(ClusterError::InternalError("wrong script".into())),
            }
        }

        async fn delete_cluster(&self, _request: &DeleteRequest) -> Result<()> {
            self.take().map(|_| ())
        }

        async fn add_nodes(&self, request: &AddNodeRequest) -> Result<NodeBatch> {
            *self.last_add.lock().unwrap() = Some(request.clone());
            match self.take()? {
                Script::Batch(batch) => Ok(batch),
                _ => Err(ClusterError::InternalError("wrong script".into())),
            }
        }

        async fn delete_nodes(&self, _request: &DeleteRequest) -> Result<Vec<Server>> {
            match self.take()? {
                Script::Servers(servers) => Ok(servers),
                _ => Err(ClusterError::InternalError("wrong script".into())),
            }
        }
    }

    fn server(n: u32) -> Server {
        Server {
            hostname: format!("alice.web.{n}"),
            ip_address: format!("52.0.0.{n}"),
            private_ip_address: format!("10.0.0.{n}"),
            storage_path: "/linker/docker/alice/web".into(),
            is_fullfilled: true,
            ..Default::default()
        }
    }

    fn user_servers() -> Vec<Server> {
        let mut servers: Vec<Server> = (1..=5).map(server).collect();
        servers[0].is_consul = true;
        servers[1].is_swarm_master = true;
        for s in &mut servers[1..4] {
            s.is_master = true;
        }
        servers[4].is_slave = true;
        servers[4].is_dns_server = true;
        servers
    }

    struct Fixture {
        orchestrator: DeploymentOrchestrator,
        clusters: Arc<ClusterLifecycle>,
        hosts: Arc<HostLifecycle>,
        deployer: Arc<Scripted>,
        _queue: WorkflowQueue,
        alice: Actor,
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
                    email: String::new(),
                },
                false,
            )
            .await;
        let identity: Arc<dyn IdentityService> = Arc::new(identity);
        let store = Arc::new(InMemoryStateStore::new());
        let hosts = Arc::new(HostLifecycle::new(store.clone(), identity.clone()));
        let (handle, queue) = workflow_queue(16);
        let clusters = Arc::new(ClusterLifecycle::new(store, identity, hosts.clone(), handle));
        let deployer = Arc::new(Scripted::default());
        Fixture {
            orchestrator: DeploymentOrchestrator::new(
                clusters.clone(),
                deployer.clone(),
                ProviderInfo::default(),
            ),
            clusters,
            hosts,
            deployer,
            _queue: queue,
            alice: Actor::token("tok-alice"),
        }
    }

    impl Fixture {
        async fn create(&self) -> Cluster {
            self.clusters
                .create(
                    CreateCluster {
                        name: "web".into(),
                        user_id: "u-alice".into(),
                        instances: 5,
                        ..Default::default()
                    },
                    &self.alice,
                )
                .await
                .unwrap()
        }

        async fn running(&self) -> Cluster {
            let cluster = self.create().await;
            self.deployer.push(Script::Servers(user_servers()));
            self.orchestrator
                .run(Workflow::CreateCluster {
                    cluster: cluster.clone(),
                })
                .await
                .unwrap();
            self.clusters.get(cluster.id, &Actor::System).await.unwrap()
        }

        async fn statuses(&self, cluster_id: ClusterId) -> Vec<LifecycleStatus> {
            self.hosts
                .query(
                    &HostQuery {
                        cluster_id: Some(cluster_id),
                        status: None,
                    },
                    &QueryOptions::default(),
                    &Actor::System,
                )
                .await
                .unwrap()
                .items
                .into_iter()
                .map(|h| h.status)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_create_success_copies_results() {
        let f = fixture().await;
        let cluster = f.running().await;
        assert_eq!(cluster.status, LifecycleStatus::Running);
        assert_eq!(cluster.endpoint, "52.0.0.5");

        let hosts = f.hosts.unterminated_of(cluster.id).await.unwrap();
        assert!(hosts.iter().all(|h| h.status == LifecycleStatus::Running));
        assert_eq!(hosts[0].host_name, "alice.web.1");
        assert!(hosts[0].is_consul);
        assert!(hosts[1].is_master_node && hosts[1].is_swarm_master);
        assert!(hosts[4].is_dns_server);
    }

    #[tokio::test]
    async fn test_coordination_failure_leaves_records_deploying() {
        let f = fixture().await;
        let cluster = f.create().await;
        f.deployer.push(Script::Fail(DeployStage::CoordinationNode));
        let err = f
            .orchestrator
            .run(Workflow::CreateCluster {
                cluster: cluster.clone(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(DeployStage::CoordinationNode));

        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.status, LifecycleStatus::Deploying);
        assert!(f
            .statuses(cluster.id)
            .await
            .iter()
            .all(|s| *s == LifecycleStatus::Deploying));
    }

    #[tokio::test]
    async fn test_later_failure_marks_everything_failed() {
        let f = fixture().await;
        let cluster = f.create().await;
        f.deployer.push(Script::Fail(DeployStage::SchedulerGroup));
        f.orchestrator
            .run(Workflow::CreateCluster {
                cluster: cluster.clone(),
            })
            .await
            .unwrap_err();

        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.status, LifecycleStatus::Failed);
        assert!(f
            .statuses(cluster.id)
            .await
            .iter()
            .all(|s| *s == LifecycleStatus::Failed));
    }

    #[tokio::test]
    async fn test_server_count_mismatch_fails_cluster() {
        let f = fixture().await;
        let cluster = f.create().await;
        let mut servers = user_servers();
        servers.pop();
        f.deployer.push(Script::Servers(servers));
        let err = f
            .orchestrator
            .run(Workflow::CreateCluster {
                cluster: cluster.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InternalError(_)));
        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.status, LifecycleStatus::Failed);
    }

    #[tokio::test]
    async fn test_partial_add_batch() {
        let f = fixture().await;
        let cluster = f.running().await;
        let new_hosts = f.clusters.add_hosts(cluster.id, "2", &f.alice).await.unwrap();

        let mut created = server(6);
        created.is_slave = true;
        f.deployer.push(Script::Batch(NodeBatch {
            requested: 2,
            servers: vec![created],
            failure: None,
        }));
        let err = f
            .orchestrator
            .run(Workflow::AddNodes {
                cluster: cluster.clone(),
                hosts: new_hosts.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::BatchFailed { failed: 1, total: 2, .. }));

        let request = f.deployer.last_add.lock().unwrap().clone().unwrap();
        assert_eq!(request.consul_server, "alice.web.1");
        assert_eq!(request.swarm_master, "alice.web.2");
        assert_eq!(request.existed_number, 5);
        assert_eq!(request.dns_servers.len(), 1);

        let first = f.hosts.get(new_hosts[0].id, &Actor::System).await.unwrap();
        assert_eq!(first.status, LifecycleStatus::Running);
        assert_eq!(first.host_name, "alice.web.6");
        let second = f.hosts.get(new_hosts[1].id, &Actor::System).await.unwrap();
        assert_eq!(second.status, LifecycleStatus::Failed);

        // both new hosts are live records, the failed one included
        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.instances, 7);
        assert_eq!(stored.status, LifecycleStatus::Running);
    }

    #[tokio::test]
    async fn test_add_compose_failure_rolls_back_new_hosts() {
        let f = fixture().await;
        let cluster = f.running().await;
        let new_hosts = f.clusters.add_hosts(cluster.id, "1", &f.alice).await.unwrap();
        f.deployer.push(Script::Batch(NodeBatch {
            requested: 1,
            servers: vec![server(6)],
            failure: Some(cluster_shared_types::StageFailure {
                stage: DeployStage::AddNodeCompose,
                message: "compose failed".into(),
            }),
        }));
        let err = f
            .orchestrator
            .run(Workflow::AddNodes {
                cluster: cluster.clone(),
                hosts: new_hosts.clone(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(DeployStage::AddNodeCompose));

        let host = f.hosts.get(new_hosts[0].id, &Actor::System).await.unwrap();
        assert_eq!(host.status, LifecycleStatus::Failed);
        assert_eq!(host.host_name, "alice.web.6");
        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.instances, 6);
    }

    #[tokio::test]
    async fn test_delete_nodes_failure_restores_status() {
        let f = fixture().await;
        let cluster = f.running().await;
        let worker = f.hosts.unterminated_of(cluster.id).await.unwrap().remove(4);
        let previous = f
            .hosts
            .terminate(worker.id, false, &Actor::System)
            .await
            .unwrap();
        let worker = f.hosts.get(worker.id, &Actor::System).await.unwrap();

        f.deployer.push(Script::Fail(DeployStage::DeleteNode));
        let original = HashMap::from([(worker.id, previous)]);
        f.orchestrator
            .run(Workflow::DeleteNodes {
                cluster: cluster.clone(),
                hosts: vec![worker.clone()],
                original,
            })
            .await
            .unwrap_err();

        let restored = f.hosts.get(worker.id, &Actor::System).await.unwrap();
        assert_eq!(restored.status, LifecycleStatus::Running);
        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.instances, 5);
    }

    #[tokio::test]
    async fn test_delete_nodes_success_adjusts_instances() {
        let f = fixture().await;
        let cluster = f.running().await;
        let worker = f.hosts.unterminated_of(cluster.id).await.unwrap().remove(4);
        f.hosts
            .terminate(worker.id, false, &Actor::System)
            .await
            .unwrap();

        f.deployer.push(Script::Servers(vec![worker.to_server()]));
        f.orchestrator
            .run(Workflow::DeleteNodes {
                cluster: cluster.clone(),
                hosts: vec![worker.clone()],
                original: HashMap::from([(worker.id, LifecycleStatus::Running)]),
            })
            .await
            .unwrap();

        let gone = f.hosts.get(worker.id, &Actor::System).await.unwrap();
        assert_eq!(gone.status, LifecycleStatus::Terminated);
        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.instances, 4);
        assert_eq!(stored.status, LifecycleStatus::Running);
    }

    #[tokio::test]
    async fn test_delete_cluster_terminates_everything() {
        let f = fixture().await;
        let cluster = f.running().await;
        let terminating = f.clusters.delete(cluster.id, &f.alice).await.unwrap();
        assert_eq!(terminating.status, LifecycleStatus::Terminating);

        f.deployer.push(Script::Servers(Vec::new()));
        f.orchestrator
            .run(Workflow::DeleteCluster {
                cluster: terminating,
            })
            .await
            .unwrap();

        let stored = f.clusters.get(cluster.id, &Actor::System).await.unwrap();
        assert_eq!(stored.status, LifecycleStatus::Terminated);
        assert_eq!(stored.instances, 0);
        assert!(f
            .statuses(cluster.id)
            .await
            .iter()
            .all(|s| *s == LifecycleStatus::Terminated));
    }
}
