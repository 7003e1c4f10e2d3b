//! Shared harness: a full cluster service on the in-memory store, static
//! identity, mock provisioner and mock scheduler, using the bundled templates.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cluster_core::deploy::{DeployService, Deployer, DeployerConfig};
use cluster_core::lifecycle::{Actor, CreateCluster, HostQuery};
use cluster_core::topology::TopologyComposer;
use cluster_core::{start_cluster_service, ClusterService, ServiceOptions};
use cluster_shared_types::{Cluster, ClusterId, Host, LifecycleStatus};
use identity_interface::{IdentityService, StaticIdentityService, UserInfo};
use provisioner::MockProvisioner;
use scheduler_interface::{DeploymentPoller, MockScheduler};
use state_store_interface::in_memory::InMemoryStateStore;
use state_store_interface::QueryOptions;

pub const ALICE: &str = "tok-alice";
pub const BOB: &str = "tok-bob";
pub const ADMIN: &str = "tok-admin";

pub struct Harness {
    pub service: ClusterService,
    pub deployer: Arc<dyn DeployService>,
    pub identity: Arc<StaticIdentityService>,
    pub provisioner: Arc<MockProvisioner>,
    pub scheduler: Arc<MockScheduler>,
    pub store: Arc<InMemoryStateStore>,
    pub root: TempDir,
}

fn templates() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates")
}

fn user(id: &str, name: &str, tenant: &str) -> UserInfo {
    UserInfo {
        user_id: id.into(),
        username: name.into(),
        tenant_id: tenant.into(),
        email: format!("{}@example.com", name),
    }
}

pub async fn harness() -> Harness {
    harness_with(ServiceOptions::default()).await
}

pub async fn harness_with(options: ServiceOptions) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let keyfile = root.path().join("mongodb-keyfile");
    tokio::fs::write(&keyfile, "secret").await.unwrap();

    let identity = Arc::new(StaticIdentityService::new());
    identity.add_user(ALICE, user("u-alice", "alice", "t-1"), false).await;
    identity.add_user(BOB, user("u-bob", "bob", "t-2"), false).await;
    identity.add_user(ADMIN, user("u-admin", "sysadmin", "t-0"), true).await;

    let provisioner = Arc::new(MockProvisioner::new());
    let scheduler = Arc::new(MockScheduler::new());
    let deployer: Arc<dyn DeployService> = Arc::new(Deployer::new(
        provisioner.clone(),
        scheduler.clone(),
        TopologyComposer::new(root.path().join("compose"), templates().join("marathon")),
        DeployerConfig {
            template_dir: templates().join("marathon"),
            config_dir: templates().join("config"),
            mongodb_keyfile: keyfile,
            poller: DeploymentPoller::new(3, Duration::from_millis(1)),
        },
    ));

    let store = Arc::new(InMemoryStateStore::new());
    let service = start_cluster_service(
        store.clone(),
        identity.clone() as Arc<dyn IdentityService>,
        deployer.clone(),
        options,
    );

    Harness {
        service,
        deployer,
        identity,
        provisioner,
        scheduler,
        store,
        root,
    }
}

pub fn alice() -> Actor {
    Actor::token(ALICE)
}

pub fn admin() -> Actor {
    Actor::token(ADMIN)
}

pub fn user_cluster(name: &str, instances: u32) -> CreateCluster {
    CreateCluster {
        name: name.into(),
        user_id: "u-alice".into(),
        instances,
        ..Default::default()
    }
}

impl Harness {
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.service.tracker.wait_idle())
            .await
            .expect("workflows did not finish");
    }

    /// Creates a cluster for alice and waits for its workflow.
    pub async fn running_cluster(&self, name: &str, instances: u32) -> Cluster {
        let cluster = self
            .service
            .clusters
            .create(user_cluster(name, instances), &alice())
            .await
            .unwrap();
        self.settle().await;
        let cluster = self.cluster(cluster.id).await;
        assert_eq!(cluster.status, LifecycleStatus::Running);
        cluster
    }

    pub async fn cluster(&self, id: ClusterId) -> Cluster {
        self.service.clusters.get(id, &Actor::System).await.unwrap()
    }

    pub async fn hosts(&self, id: ClusterId) -> Vec<Host> {
        self.service
            .hosts()
            .query(
                &HostQuery {
                    cluster_id: Some(id),
                    status: None,
                },
                &QueryOptions::default(),
                &Actor::System,
            )
            .await
            .unwrap()
            .items
    }

    pub async fn live_hosts(&self, id: ClusterId) -> Vec<Host> {
        self.hosts(id)
            .await
            .into_iter()
            .filter(|h| h.status != LifecycleStatus::Terminated)
            .collect()
    }
}
