use std::sync::Arc;

use cluster_shared_types::{
    Cluster, ClusterError, ClusterId, Host, HostId, HostStatus, LifecycleStatus, Result, Server,
};
use identity_interface::{Action, IdentityService, ResourceKind};
use serde::Serialize;
use serde_json::Value;
use state_store_interface::{Collection, Filter, Page, QueryOptions, StateStore, StateStoreExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{authorize, scope, status_fields, timestamp, Actor, StatusFilter, Transition};

/// Selector for host listings.
#[derive(Debug, Clone, Default)]
pub struct HostQuery {
    pub cluster_id: Option<ClusterId>,
    pub status: Option<StatusFilter>,
}

impl HostQuery {
    fn to_filter(&self) -> Filter {
        let mut filter = Filter::All;
        if let Some(cluster_id) = self.cluster_id {
            filter = filter.and(Filter::eq("cluster_id", cluster_id));
        }
        if let Some(status) = self.status {
            filter = filter.and(status.to_filter());
        }
        filter
    }
}

/// Provisioning results written onto a host record. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_master_node: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_slave_node: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_swarm_master: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_consul: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_fullfilled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dns_server: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
}

impl HostUpdate {
    pub fn from_server(server: &Server) -> Self {
        Self {
            host_name: Some(server.hostname.clone()),
            ip: Some(server.ip_address.clone()),
            private_ip: Some(server.private_ip_address.clone()),
            is_master_node: Some(server.is_master),
            is_slave_node: Some(server.is_slave),
            is_swarm_master: Some(server.is_swarm_master),
            is_consul: Some(server.is_consul),
            is_fullfilled: Some(server.is_fullfilled),
            is_dns_server: Some(server.is_dns_server),
            storage_path: Some(server.storage_path.clone()),
        }
    }

    /// Only the machine identity, enough to delete it later.
    pub fn identity_of(server: &Server) -> Self {
        Self {
            host_name: Some(server.hostname.clone()),
            ip: Some(server.ip_address.clone()),
            private_ip: Some(server.private_ip_address.clone()),
            storage_path: Some(server.storage_path.clone()),
            ..Default::default()
        }
    }
}

/// Rejects a user-initiated termination of a host that may not go away.
pub fn check_terminable(host: &Host, allow_master: bool) -> Result<()> {
    if host.is_master_node && !allow_master {
        return Err(ClusterError::InvalidState(format!(
            "host {} is a scheduler master and cannot be terminated",
            host.id
        )));
    }
    match host.status {
        LifecycleStatus::Running | LifecycleStatus::Failed => Ok(()),
        LifecycleStatus::Deploying
        | LifecycleStatus::Terminating
        | LifecycleStatus::Terminated => Err(ClusterError::InvalidState(format!(
            "host {} is {}",
            host.id, host.status
        ))),
    }
}

/// Termination check for a host that never got a machine. Such a host can
/// be dropped straight from DEPLOYING or FAILED.
pub fn check_discardable(host: &Host) -> Result<()> {
    if host.is_master_node {
        return check_terminable(host, false);
    }
    match host.status {
        LifecycleStatus::Terminating | LifecycleStatus::Terminated => Err(
            ClusterError::InvalidState(format!("host {} is {}", host.id, host.status)),
        ),
        LifecycleStatus::Deploying | LifecycleStatus::Running | LifecycleStatus::Failed => Ok(()),
    }
}

/// Owns host records.
pub struct HostLifecycle {
    store: Arc<dyn StateStore>,
    identity: Arc<dyn IdentityService>,
}

impl HostLifecycle {
    pub fn new(store: Arc<dyn StateStore>, identity: Arc<dyn IdentityService>) -> Self {
        Self { store, identity }
    }

    pub async fn create(&self, host: Host, actor: &Actor) -> Result<Host> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::CreateHost,
            None,
            ResourceKind::Host,
        )
        .await?;
        self.store
            .insert_record(Collection::Hosts, &host.id.to_string(), &host)
            .await?;
        debug!(host_id = %host.id, cluster_id = %host.cluster_id, "Created host record");
        Ok(host)
    }

    /// Creates `count` DEPLOYING records with no machine behind them yet.
    pub async fn create_pending(
        &self,
        cluster: &Cluster,
        count: u32,
        actor: &Actor,
    ) -> Result<Vec<Host>> {
        let mut hosts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let now = self.store.now();
            let host = Host {
                id: Uuid::new_v4(),
                host_name: String::new(),
                cluster_id: cluster.id,
                cluster_name: cluster.name.clone(),
                status: LifecycleStatus::Deploying,
                ip: String::new(),
                private_ip: String::new(),
                is_master_node: false,
                is_slave_node: false,
                is_swarm_master: false,
                is_consul: false,
                is_fullfilled: false,
                is_dns_server: false,
                storage_path: String::new(),
                user_id: cluster.user_id.clone(),
                username: cluster.owner.clone(),
                tenant_id: cluster.tenant_id.clone(),
                time_create: now,
                time_update: now,
            };
            hosts.push(self.create(host, actor).await?);
        }
        Ok(hosts)
    }

    pub async fn get(&self, id: HostId, actor: &Actor) -> Result<Host> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::GetHost,
            Some(&id.to_string()),
            ResourceKind::Host,
        )
        .await?;
        self.load(id, actor, Action::GetHost).await
    }

    async fn load(&self, id: HostId, actor: &Actor, action: Action) -> Result<Host> {
        let filter = Filter::eq("id", id).and(scope(self.identity.as_ref(), actor, action).await?);
        self.store
            .find_one(Collection::Hosts, &filter)
            .await?
            .ok_or_else(|| ClusterError::not_found("Host", id))
    }

    /// Lists hosts, oldest first unless `options` says otherwise.
    pub async fn query(
        &self,
        query: &HostQuery,
        options: &QueryOptions,
        actor: &Actor,
    ) -> Result<Page<Host>> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::GetHost,
            None,
            ResourceKind::Host,
        )
        .await?;
        let filter = query
            .to_filter()
            .and(scope(self.identity.as_ref(), actor, Action::GetHost).await?);
        let mut options = options.clone();
        if options.sort.is_none() {
            options.sort = Some("time_create".to_string());
        }
        self.store
            .query_records(Collection::Hosts, &filter, &options)
            .await
    }

    /// Every host of the cluster that is not TERMINATED, oldest first.
    pub async fn unterminated_of(&self, cluster_id: ClusterId) -> Result<Vec<Host>> {
        let query = HostQuery {
            cluster_id: Some(cluster_id),
            status: Some(StatusFilter::Unterminated),
        };
        Ok(self
            .query(&query, &QueryOptions::default(), &Actor::System)
            .await?
            .items)
    }

    /// The single place a host's status changes.
    pub async fn update_status(
        &self,
        id: HostId,
        status: HostStatus,
        actor: &Actor,
    ) -> Result<Transition> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::UpdateHost,
            Some(&id.to_string()),
            ResourceKind::Host,
        )
        .await?;
        let host = self.load(id, actor, Action::UpdateHost).await?;
        if host.status == status {
            return Ok(Transition::Unchanged);
        }
        self.store
            .update_fields(
                Collection::Hosts,
                &Filter::eq("id", id),
                status_fields(status, self.store.now()),
            )
            .await?;
        debug!(host_id = %id, from = %host.status, to = %status, "Host status changed");
        Ok(Transition::Applied)
    }

    pub async fn update_fields(
        &self,
        id: HostId,
        update: HostUpdate,
        actor: &Actor,
    ) -> Result<Host> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::UpdateHost,
            Some(&id.to_string()),
            ResourceKind::Host,
        )
        .await?;
        self.load(id, actor, Action::UpdateHost).await?;

        let mut fields = match serde_json::to_value(&update) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => serde_json::Map::new(),
            Err(e) => return Err(ClusterError::InternalError(e.to_string())),
        };
        fields.insert("time_update".to_string(), timestamp(self.store.now()));
        self.store
            .update_fields(Collection::Hosts, &Filter::eq("id", id), fields)
            .await?;
        self.load(id, actor, Action::UpdateHost).await
    }

    /// Moves a RUNNING or FAILED host to TERMINATING and returns the status
    /// it had before.
    pub async fn terminate(
        &self,
        id: HostId,
        allow_master: bool,
        actor: &Actor,
    ) -> Result<HostStatus> {
        authorize(
            self.identity.as_ref(),
            actor,
            Action::DeleteHost,
            Some(&id.to_string()),
            ResourceKind::Host,
        )
        .await?;
        let host = self.load(id, actor, Action::DeleteHost).await?;
        check_terminable(&host, allow_master)?;
        self.update_status(id, LifecycleStatus::Terminating, actor)
            .await?;
        info!(host_id = %id, previous = %host.status, "Host terminating");
        Ok(host.status)
    }

    /// Marks every non-terminated host of a cluster with `status`, carrying
    /// on past individual failures. Returns the number of failed writes.
    pub async fn mark_all(&self, cluster_id: ClusterId, status: HostStatus) -> Result<usize> {
        let hosts = self.unterminated_of(cluster_id).await?;
        let mut failed = 0;
        for host in hosts {
            if let Err(e) = self.update_status(host.id, status, &Actor::System).await {
                warn!(host_id = %host.id, error = %e, "Failed to update host status");
                failed += 1;
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cluster_shared_types::ClusterType;
    use identity_interface::{StaticIdentityService, UserInfo};
    use state_store_interface::in_memory::InMemoryStateStore;

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
            status: LifecycleStatus::Running,
            cluster_type: ClusterType::User,
            time_create: Utc::now(),
            time_update: Utc::now(),
        }
    }

    async fn setup() -> (HostLifecycle, Actor, Actor) {
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
        identity
            .add_user(
                "tok-bob",
                UserInfo {
                    user_id: "u-bob".into(),
                    username: "bob".into(),
                    tenant_id: "t-2".into(),
                    email: String::new(),
                },
                false,
            )
            .await;
        let hosts = HostLifecycle::new(Arc::new(InMemoryStateStore::new()), Arc::new(identity));
        (hosts, Actor::token("tok-alice"), Actor::token("tok-bob"))
    }

    #[tokio::test]
    async fn test_pending_hosts_are_scoped_to_owner() {
        let (hosts, alice, bob) = setup().await;
        let cluster = cluster();
        let created = hosts.create_pending(&cluster, 3, &alice).await.unwrap();
        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|h| h.status == LifecycleStatus::Deploying));
        assert!(created.iter().all(|h| !h.is_provisioned()));

        let query = HostQuery {
            cluster_id: Some(cluster.id),
            status: None,
        };
        let mine = hosts.query(&query, &QueryOptions::default(), &alice).await.unwrap();
        assert_eq!(mine.total, 3);
        let theirs = hosts.query(&query, &QueryOptions::default(), &bob).await.unwrap();
        assert_eq!(theirs.total, 0);

        let err = hosts.get(created[0].id, &bob).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_status_is_idempotent() {
        let (hosts, alice, _) = setup().await;
        let host = hosts.create_pending(&cluster(), 1, &alice).await.unwrap().remove(0);

        let first = hosts
            .update_status(host.id, LifecycleStatus::Running, &alice)
            .await
            .unwrap();
        assert_eq!(first, Transition::Applied);
        let stamped = hosts.get(host.id, &alice).await.unwrap().time_update;

        let second = hosts
            .update_status(host.id, LifecycleStatus::Running, &alice)
            .await
            .unwrap();
        assert_eq!(second, Transition::Unchanged);
        assert_eq!(hosts.get(host.id, &alice).await.unwrap().time_update, stamped);
    }

    #[tokio::test]
    async fn test_terminate_guards() {
        let (hosts, alice, _) = setup().await;
        let host = hosts.create_pending(&cluster(), 1, &alice).await.unwrap().remove(0);

        // still deploying
        assert!(hosts.terminate(host.id, false, &alice).await.is_err());

        hosts
            .update_status(host.id, LifecycleStatus::Running, &alice)
            .await
            .unwrap();
        hosts
            .update_fields(
                host.id,
                HostUpdate {
                    is_master_node: Some(true),
                    ..Default::default()
                },
                &alice,
            )
            .await
            .unwrap();

        let err = hosts.terminate(host.id, false, &alice).await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidState(_)));
        assert_eq!(
            hosts.get(host.id, &alice).await.unwrap().status,
            LifecycleStatus::Running
        );

        let previous = hosts.terminate(host.id, true, &alice).await.unwrap();
        assert_eq!(previous, LifecycleStatus::Running);
        assert_eq!(
            hosts.get(host.id, &alice).await.unwrap().status,
            LifecycleStatus::Terminating
        );
    }

    #[tokio::test]
    async fn test_unprovisioned_hosts_are_discardable() {
        let (hosts, alice, _) = setup().await;
        let mut host = hosts.create_pending(&cluster(), 1, &alice).await.unwrap().remove(0);

        assert!(check_terminable(&host, false).is_err());
        check_discardable(&host).unwrap();
        host.status = LifecycleStatus::Failed;
        check_discardable(&host).unwrap();
        host.status = LifecycleStatus::Terminated;
        assert!(check_discardable(&host).is_err());

        host.status = LifecycleStatus::Failed;
        host.is_master_node = true;
        assert!(check_discardable(&host).is_err());
    }

    #[tokio::test]
    async fn test_update_fields_from_server() {
        let (hosts, alice, _) = setup().await;
        let host = hosts.create_pending(&cluster(), 1, &alice).await.unwrap().remove(0);
        let server = Server {
            hostname: "alice.web.1".into(),
            ip_address: "52.0.0.1".into(),
            private_ip_address: "10.0.0.1".into(),
            storage_path: "/s".into(),
            is_slave: true,
            is_dns_server: true,
            ..Default::default()
        };

        let updated = hosts
            .update_fields(host.id, HostUpdate::from_server(&server), &Actor::System)
            .await
            .unwrap();
        assert_eq!(updated.host_name, "alice.web.1");
        assert!(updated.is_slave_node && updated.is_dns_server);
        assert!(!updated.is_master_node);
        assert_eq!(updated.status, LifecycleStatus::Deploying);
    }
}
