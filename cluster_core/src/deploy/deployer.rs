//! In-process deployment module driving the provisioner and the scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cluster_shared_types::{
    AddNodeRequest, ClusterError, ClusterType, DeleteRequest, DeployRequest, DeployStage,
    DnsConfig, NodeBatch, Result, Server, ServiceGroup, StageFailure, MIN_CLUSTER_SIZE,
};
use provisioning_interface::{ComposeScale, MachineSpec, Provisioner};
use scheduler_interface::{DeploymentPoller, SchedulerClient};
use tracing::{debug, info, warn};

use super::payloads::{self, load_template};
use super::{DeployService, StageExt};
use crate::topology::{self, NodePlan, Topology, TopologyComposer};

const REMOTE_CONFIG_DIR: &str = "/linker/config";
const REMOTE_DNS_CONFIG: &str = "/linker/config/config.json";
const REMOTE_KEY_DIR: &str = "/linker/key";
const REMOTE_KEYFILE: &str = "/linker/key/mongodb-keyfile";
const RENDERED_DNS_CONFIG: &str = "config.json";

#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Scheduler group templates.
    pub template_dir: PathBuf,
    /// Holds the DNS configuration template.
    pub config_dir: PathBuf,
    /// Key file shared by the management cluster's database replicas.
    pub mongodb_keyfile: PathBuf,
    pub poller: DeploymentPoller,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("/linker/marathon"),
            config_dir: PathBuf::from("/linker/config"),
            mongodb_keyfile: PathBuf::from(REMOTE_KEYFILE),
            poller: DeploymentPoller::default(),
        }
    }
}

pub struct Deployer {
    provisioner: Arc<dyn Provisioner>,
    scheduler: Arc<dyn SchedulerClient>,
    composer: TopologyComposer,
    config: DeployerConfig,
}

impl Deployer {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        scheduler: Arc<dyn SchedulerClient>,
        composer: TopologyComposer,
        config: DeployerConfig,
    ) -> Self {
        Self {
            provisioner,
            scheduler,
            composer,
            config,
        }
    }

    async fn create_node(
        &self,
        user_name: &str,
        cluster_name: &str,
        request_id: &str,
        provider: &cluster_shared_types::ProviderInfo,
        node: &NodePlan,
        consul_host: Option<&str>,
    ) -> Result<Server> {
        let spec = MachineSpec {
            user_name: user_name.to_string(),
            cluster_name: cluster_name.to_string(),
            swarm: node.swarm(),
            swarm_master: node.swarm_master,
            consul_host: consul_host.map(str::to_string),
            provider: provider.clone(),
            labels: node.labels(request_id),
        };
        let mut server = self.provisioner.create_machine(&spec).await?;
        node.apply(&mut server);
        debug!(host = %server.hostname, ?node, "Machine ready");
        Ok(server)
    }

    async fn compose(
        &self,
        user_name: &str,
        cluster_name: &str,
        topology: &Topology,
        workers: u32,
    ) -> Result<()> {
        let compose_file = self
            .composer
            .write_membership(user_name, cluster_name, topology)
            .await?;
        let leader = topology
            .swarm_leader()
            .ok_or_else(|| ClusterError::InternalError("cluster has no swarm leader".to_string()))?;
        self.provisioner
            .compose_scale(&ComposeScale {
                swarm_master: leader.hostname.clone(),
                storage_path: leader.storage_path.clone(),
                compose_file,
                workers,
            })
            .await
    }

    /// Renders the DNS configuration for a cluster and returns its path.
    async fn render_dns_config(
        &self,
        user_name: &str,
        cluster_name: &str,
        topology: &Topology,
    ) -> Result<PathBuf> {
        let template: DnsConfig =
            load_template(&self.config.config_dir.join(payloads::DNS_CONFIG_TEMPLATE)).await?;
        let config = payloads::dns_config(template, &topology.master_public_ips());
        let body = serde_json::to_vec_pretty(&config)
            .map_err(|e| ClusterError::InternalError(e.to_string()))?;

        let dir = self.composer.cluster_dir(user_name, cluster_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ClusterError::ProvisioningError(format!("{}: {}", dir.display(), e)))?;
        let path = dir.join(RENDERED_DNS_CONFIG);
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ClusterError::ProvisioningError(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }

    /// Creates a remote directory owned by the login user, then copies a file
    /// into it.
    async fn push_file(
        &self,
        server: &Server,
        ssh_user: &str,
        remote_dir: &str,
        local: &std::path::Path,
        remote: &str,
    ) -> Result<()> {
        let prepare = format!(
            "sudo mkdir -p {dir} && sudo chown -R {user}:{user} /linker",
            dir = remote_dir,
            user = ssh_user
        );
        self.provisioner
            .run_on_machine(&server.hostname, &prepare, &server.storage_path)
            .await?;
        self.provisioner
            .copy_to_machine(&server.hostname, local, remote, &server.storage_path)
            .await
    }

    async fn set_nameserver(&self, server: &Server, nameserver: &str) -> Result<()> {
        let command = format!("sudo sed -i '1inameserver {}' /etc/resolv.conf", nameserver);
        self.provisioner
            .run_on_machine(&server.hostname, &command, &server.storage_path)
            .await
            .map(|_| ())
    }

    /// Submits a group and waits for the scheduler to finish deploying it.
    async fn deploy_group(&self, group: &ServiceGroup, endpoint: &str) -> Result<()> {
        let deployment_id = self.scheduler.submit_group(group, endpoint).await?;
        if self
            .config
            .poller
            .poll_until_done(self.scheduler.as_ref(), &deployment_id, endpoint)
            .await
        {
            Ok(())
        } else {
            Err(ClusterError::SchedulerError(format!(
                "deployment {} of group {} did not finish",
                deployment_id, group.id
            )))
        }
    }

    async fn group_template(&self, name: &str) -> Result<ServiceGroup> {
        load_template(&self.config.template_dir.join(name)).await
    }

    fn storage_path_of(&self, server: &Server, user_name: &str, cluster_name: &str) -> String {
        if server.storage_path.trim().is_empty() {
            self.provisioner.storage_path(user_name, cluster_name)
        } else {
            server.storage_path.clone()
        }
    }
}

fn ssh_user(request_user: &str) -> &str {
    // fall back to the remote login name
    if request_user.trim().is_empty() {
        "$USER"
    } else {
        request_user
    }
}

fn cluster_type(management: bool) -> ClusterType {
    if management {
        ClusterType::Mgmt
    } else {
        ClusterType::User
    }
}

#[async_trait]
impl DeployService for Deployer {
    async fn create_cluster(&self, request: &DeployRequest) -> Result<Vec<Server>> {
        if request.cluster_number < MIN_CLUSTER_SIZE {
            return Err(ClusterError::Validation(format!(
                "a cluster needs at least {} nodes, got {}",
                MIN_CLUSTER_SIZE, request.cluster_number
            )));
        }
        let user = request.user_name.as_str();
        let cluster = request.cluster_name.as_str();
        let management = request.management;
        let ssh_user = ssh_user(&request.provider_info.provider.ssh_user);
        let plan = topology::plan(request.cluster_number, management);
        let (coordination, members) = plan
            .split_first()
            .ok_or_else(|| ClusterError::Validation("empty cluster".to_string()))?;

        info!(
            user,
            cluster,
            instances = request.cluster_number,
            management,
            "Creating coordination node"
        );
        let consul = self
            .create_node(
                user,
                cluster,
                &request.request_id,
                &request.provider_info,
                coordination,
                None,
            )
            .await
            .stage(DeployStage::CoordinationNode)?;
        self.provisioner
            .boot_coordination(&consul)
            .await
            .stage(DeployStage::CoordinationNode)?;

        info!(user, cluster, count = members.len(), "Creating cluster machines");
        let mut servers = Vec::with_capacity(plan.len());
        servers.push(consul);
        for node in members {
            let consul_host = servers[0].hostname.clone();
            let server = self
                .create_node(
                    user,
                    cluster,
                    &request.request_id,
                    &request.provider_info,
                    node,
                    Some(&consul_host),
                )
                .await
                .stage(DeployStage::CreateMachine)?;
            servers.push(server);
        }
        let topology = Topology::new(servers);

        let workers = request
            .cluster_number
            .saturating_sub(cluster_type(management).reserved_nodes());
        info!(user, cluster, workers, "Composing scheduler stack");
        self.compose(user, cluster, &topology, workers)
            .await
            .stage(DeployStage::Compose)?;

        let dns_servers = topology.dns_servers();
        let dns = dns_servers.first().copied().ok_or_else(|| {
            ClusterError::deployment(DeployStage::DnsConfig, "cluster has no DNS server")
        })?;

        info!(user, cluster, dns_servers = dns_servers.len(), "Distributing DNS configuration");
        let rendered = self
            .render_dns_config(user, cluster, &topology)
            .await
            .stage(DeployStage::DnsConfig)?;
        for server in &dns_servers {
            self.push_file(server, ssh_user, REMOTE_CONFIG_DIR, &rendered, REMOTE_DNS_CONFIG)
                .await
                .stage(DeployStage::CopyConfig)?;
        }

        info!(user, cluster, "Pointing nameservers");
        for server in topology.swarm_members() {
            let nameserver = if management {
                server.ip_address.as_str()
            } else {
                dns.ip_address.as_str()
            };
            self.set_nameserver(server, nameserver)
                .await
                .stage(DeployStage::Nameserver)?;
        }

        let endpoint = topology.scheduler_endpoint().ok_or_else(|| {
            ClusterError::deployment(DeployStage::SchedulerGroup, "cluster has no scheduler master")
        })?;

        info!(user, cluster, endpoint = %endpoint, "Deploying DNS and load balancer");
        let template = self
            .group_template(payloads::DNS_LB_TEMPLATE)
            .await
            .stage(DeployStage::SchedulerGroup)?;
        let group = payloads::dns_lb_group(template, user, cluster, &dns.ip_address, management);
        self.deploy_group(&group, &endpoint)
            .await
            .stage(DeployStage::SchedulerGroup)?;

        if management {
            info!(user, cluster, "Deploying management components");
            for master in topology.masters() {
                self.push_file(
                    master,
                    ssh_user,
                    REMOTE_KEY_DIR,
                    &self.config.mongodb_keyfile,
                    REMOTE_KEYFILE,
                )
                .await
                .stage(DeployStage::CopyConfig)?;
            }
            let leader = topology.swarm_leader().ok_or_else(|| {
                ClusterError::deployment(DeployStage::SchedulerGroup, "cluster has no swarm leader")
            })?;
            let template = self
                .group_template(payloads::COMPONENTS_TEMPLATE)
                .await
                .stage(DeployStage::SchedulerGroup)?;
            let group = payloads::components_group(
                template,
                &topology.master_private_ips(),
                &leader.ip_address,
            );
            self.deploy_group(&group, &endpoint)
                .await
                .stage(DeployStage::SchedulerGroup)?;
        }

        info!(user, cluster, "Deploying dashboard");
        let template = self
            .group_template(payloads::DASHBOARD_TEMPLATE)
            .await
            .stage(DeployStage::SchedulerGroup)?;
        let group = payloads::dashboard_group(
            template,
            &topology.master_public_ips(),
            &dns.ip_address,
            management,
        );
        self.deploy_group(&group, &endpoint)
            .await
            .stage(DeployStage::SchedulerGroup)?;

        info!(user, cluster, nodes = topology.servers.len(), "Cluster deployed");
        Ok(topology.servers)
    }

    async fn delete_cluster(&self, request: &DeleteRequest) -> Result<()> {
        info!(
            user = %request.user_name,
            cluster = %request.cluster_name,
            count = request.servers.len(),
            "Deleting cluster machines"
        );
        let mut failures = Vec::new();
        for server in &request.servers {
            if server.hostname.trim().is_empty() {
                continue;
            }
            let storage = self.storage_path_of(server, &request.user_name, &request.cluster_name);
            if let Err(e) = self
                .provisioner
                .delete_machine(&server.hostname, &storage)
                .await
            {
                warn!(host = %server.hostname, error = %e, "Machine deletion failed");
                failures.push(format!("{}: {}", server.hostname, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::deployment(
                DeployStage::DeleteCluster,
                failures.join("; "),
            ))
        }
    }

    async fn add_nodes(&self, request: &AddNodeRequest) -> Result<NodeBatch> {
        let user = request.user_name.as_str();
        let cluster = request.cluster_name.as_str();
        let node = NodePlan::worker();
        info!(user, cluster, count = request.create_number, "Creating worker machines");

        let mut servers = Vec::with_capacity(request.create_number as usize);
        for _ in 0..request.create_number {
            match self
                .create_node(
                    user,
                    cluster,
                    &request.request_id,
                    &request.provider_info,
                    &node,
                    Some(&request.consul_server),
                )
                .await
            {
                Ok(server) => servers.push(server),
                Err(e) => warn!(user, cluster, error = %e, "Worker machine creation failed"),
            }
        }
        let mut batch = NodeBatch {
            requested: request.create_number,
            servers,
            failure: None,
        };
        if batch.servers.is_empty() {
            batch.failure = Some(StageFailure {
                stage: DeployStage::AddNodeMachine,
                message: "no machine could be created".to_string(),
            });
            return Ok(batch);
        }

        let created = batch.servers.len() as u32;
        let workers = (request.existed_number + created)
            .saturating_sub(cluster_type(request.management).reserved_nodes());
        info!(user, cluster, created, workers, "Scaling scheduler stack");
        let composed = match self
            .composer
            .append_members(user, cluster, &batch.servers)
            .await
        {
            Ok(compose_file) => {
                self.provisioner
                    .compose_scale(&ComposeScale {
                        swarm_master: request.swarm_master.clone(),
                        storage_path: self.provisioner.storage_path(user, cluster),
                        compose_file,
                        workers,
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = composed {
            batch.failure = Some(StageFailure {
                stage: DeployStage::AddNodeCompose,
                message: e.to_string(),
            });
            return Ok(batch);
        }

        match request.dns_servers.first() {
            Some(dns) => {
                for server in &batch.servers {
                    if let Err(e) = self.set_nameserver(server, &dns.ip_address).await {
                        batch.failure = Some(StageFailure {
                            stage: DeployStage::Nameserver,
                            message: e.to_string(),
                        });
                        return Ok(batch);
                    }
                }
            }
            None => warn!(user, cluster, "Cluster has no DNS server, nameservers left unchanged"),
        }
        Ok(batch)
    }

    async fn delete_nodes(&self, request: &DeleteRequest) -> Result<Vec<Server>> {
        let user = request.user_name.as_str();
        let cluster = request.cluster_name.as_str();
        info!(user, cluster, count = request.servers.len(), "Deleting worker machines");

        let mut confirmed = Vec::new();
        let mut first_error = None;
        for server in &request.servers {
            let storage = self.storage_path_of(server, user, cluster);
            if let Err(e) = self
                .provisioner
                .delete_machine(&server.hostname, &storage)
                .await
            {
                warn!(host = %server.hostname, error = %e, "Machine deletion failed");
                first_error.get_or_insert(e);
                continue;
            }
            // a host that keeps its machine keeps its membership line
            if let Err(e) = self
                .composer
                .remove_member(user, cluster, &server.hostname)
                .await
            {
                warn!(host = %server.hostname, error = %e, "Membership update failed");
            }
            confirmed.push(server.clone());
        }

        match first_error {
            Some(e) if confirmed.is_empty() => Err(ClusterError::deployment(
                DeployStage::DeleteNode,
                e.to_string(),
            )),
            _ => Ok(confirmed),
        }
    }
}
