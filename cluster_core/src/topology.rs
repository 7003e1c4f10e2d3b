//! Node roles for a cluster and the composition tool's membership file.
//!
//! The first machine of every cluster is the coordination node. A
//! management cluster then gets a swarm leader and further nodes that are
//! all scheduler masters and workers at once; the masters double as DNS
//! servers. A user cluster gets a swarm leader, two more masters and the
//! remaining nodes as workers, the first of which serves DNS.

use std::path::{Path, PathBuf};

use cluster_shared_types::{ClusterError, Result, Server};
use provisioning_interface::MachineLabel;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Scheduler masters the composed stack is built around.
pub const SCHEDULER_MASTERS: usize = 3;

const ENV_FILE: &str = ".env";
const COMPOSE_FILE: &str = "docker-compose.yml";

/// Role assigned to one machine before it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub consul: bool,
    pub swarm_master: bool,
    pub master: bool,
    pub slave: bool,
    pub dns_server: bool,
}

impl NodePlan {
    fn coordination() -> Self {
        Self {
            consul: true,
            swarm_master: false,
            master: false,
            slave: false,
            dns_server: false,
        }
    }

    /// Worker added to a running cluster.
    pub fn worker() -> Self {
        Self {
            consul: false,
            swarm_master: false,
            master: false,
            slave: true,
            dns_server: false,
        }
    }

    /// Whether the machine joins the swarm.
    pub fn swarm(&self) -> bool {
        !self.consul
    }

    pub fn labels(&self, request_id: &str) -> Vec<MachineLabel> {
        let mut labels = Vec::new();
        if self.master {
            labels.push(MachineLabel::master());
        }
        if self.slave {
            labels.push(MachineLabel::slave());
        }
        labels.push(MachineLabel::request(request_id));
        labels
    }

    /// Copy the role flags onto a freshly provisioned server.
    pub fn apply(&self, server: &mut Server) {
        server.is_consul = self.consul;
        server.is_swarm_master = self.swarm_master;
        server.is_master = self.master;
        server.is_slave = self.slave;
        server.is_dns_server = self.dns_server;
    }
}

/// Roles for a cluster of `instances` machines, coordination node first.
pub fn plan(instances: u32, management: bool) -> Vec<NodePlan> {
    let instances = instances as usize;
    let mut nodes = Vec::with_capacity(instances);
    if instances == 0 {
        return nodes;
    }
    nodes.push(NodePlan::coordination());

    for index in 1..instances {
        let node = if management {
            NodePlan {
                consul: false,
                swarm_master: index == 1,
                master: true,
                slave: true,
                dns_server: true,
            }
        } else if index <= SCHEDULER_MASTERS {
            NodePlan {
                consul: false,
                swarm_master: index == 1,
                master: true,
                slave: false,
                dns_server: false,
            }
        } else {
            NodePlan {
                consul: false,
                swarm_master: false,
                master: false,
                slave: true,
                dns_server: index == SCHEDULER_MASTERS + 1,
            }
        };
        nodes.push(node);
    }
    nodes
}

/// Provisioned servers of a cluster in creation order.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub servers: Vec<Server>,
}

impl Topology {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    pub fn coordination(&self) -> Option<&Server> {
        self.servers.iter().find(|s| s.is_consul)
    }

    pub fn swarm_leader(&self) -> Option<&Server> {
        self.servers.iter().find(|s| s.is_swarm_master)
    }

    /// Every swarm member, i.e. everything but the coordination node.
    pub fn swarm_members(&self) -> Vec<&Server> {
        self.servers.iter().filter(|s| !s.is_consul).collect()
    }

    pub fn masters(&self) -> Vec<&Server> {
        self.servers.iter().filter(|s| s.is_master).collect()
    }

    pub fn workers(&self) -> Vec<&Server> {
        self.servers.iter().filter(|s| s.is_slave).collect()
    }

    pub fn dns_servers(&self) -> Vec<&Server> {
        self.servers.iter().filter(|s| s.is_dns_server).collect()
    }

    pub fn master_private_ips(&self) -> Vec<String> {
        self.masters()
            .iter()
            .map(|s| s.private_ip_address.clone())
            .collect()
    }

    pub fn master_public_ips(&self) -> Vec<String> {
        self.masters().iter().map(|s| s.ip_address.clone()).collect()
    }

    /// Scheduler control plane address, served by the first master.
    pub fn scheduler_endpoint(&self) -> Option<String> {
        self.masters()
            .first()
            .map(|s| format!("{}:8080", s.private_ip_address))
    }
}

/// `hostname=publicIp` membership line for a worker.
fn member_line(server: &Server) -> String {
    format!("{}={}", server.hostname, server.ip_address)
}

/// Header of the membership file, built from the first three masters.
pub fn env_header(master_ips: &[String]) -> Result<String> {
    if master_ips.len() < SCHEDULER_MASTERS {
        return Err(ClusterError::Validation(format!(
            "{} scheduler masters required, {} available",
            SCHEDULER_MASTERS,
            master_ips.len()
        )));
    }
    let masters = &master_ips[..SCHEDULER_MASTERS];
    let zookeepers = masters
        .iter()
        .map(|ip| format!("{}:2888:3888", ip))
        .collect::<Vec<_>>()
        .join(",");
    let clients = masters
        .iter()
        .map(|ip| format!("{}:2181", ip))
        .collect::<Vec<_>>()
        .join(",");
    let mesos_zk = format!("zk://{}/mesos", clients);

    Ok(format!(
        "ZOOKEEPERLIST={zookeepers}\n\
         MESOS_ZK={mesos_zk}\n\
         MESOS_MASTER={mesos_zk}\n\
         MARATHON_MASTER={mesos_zk}\n\
         MARATHON_ZK=zk://{clients}/marathon\n\
         MESOS_HOSTNAME_LOOKUP=false\n"
    ))
}

/// Owns the per-cluster directories read by the composition tool.
#[derive(Debug, Clone)]
pub struct TopologyComposer {
    compose_root: PathBuf,
    template_dir: PathBuf,
}

impl TopologyComposer {
    pub fn new(compose_root: impl Into<PathBuf>, template_dir: impl Into<PathBuf>) -> Self {
        Self {
            compose_root: compose_root.into(),
            template_dir: template_dir.into(),
        }
    }

    pub fn cluster_dir(&self, user_name: &str, cluster_name: &str) -> PathBuf {
        self.compose_root.join(user_name).join(cluster_name)
    }

    pub fn compose_file(&self, user_name: &str, cluster_name: &str) -> PathBuf {
        self.cluster_dir(user_name, cluster_name).join(COMPOSE_FILE)
    }

    pub fn env_file(&self, user_name: &str, cluster_name: &str) -> PathBuf {
        self.cluster_dir(user_name, cluster_name).join(ENV_FILE)
    }

    /// Creates the cluster directory and copies the compose template into
    /// it on first use.
    async fn prepare_dir(&self, user_name: &str, cluster_name: &str) -> Result<PathBuf> {
        let dir = self.cluster_dir(user_name, cluster_name);
        tokio::fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;
        let compose = dir.join(COMPOSE_FILE);
        if !path_exists(&compose).await {
            let template = self.template_dir.join(COMPOSE_FILE);
            tokio::fs::copy(&template, &compose)
                .await
                .map_err(io_error(&template))?;
        }
        Ok(compose)
    }

    /// Writes the membership file for a new cluster and returns the compose
    /// file to run against.
    pub async fn write_membership(
        &self,
        user_name: &str,
        cluster_name: &str,
        topology: &Topology,
    ) -> Result<PathBuf> {
        let compose = self.prepare_dir(user_name, cluster_name).await?;
        let mut content = env_header(&topology.master_private_ips())?;
        for worker in topology.workers() {
            content.push_str(&member_line(worker));
            content.push('\n');
        }

        let env = self.env_file(user_name, cluster_name);
        tokio::fs::write(&env, content)
            .await
            .map_err(io_error(&env))?;
        debug!(path = %env.display(), "Wrote cluster membership");
        Ok(compose)
    }

    /// Appends workers to an existing membership file.
    pub async fn append_members(
        &self,
        user_name: &str,
        cluster_name: &str,
        servers: &[Server],
    ) -> Result<PathBuf> {
        let compose = self.prepare_dir(user_name, cluster_name).await?;
        let env = self.env_file(user_name, cluster_name);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&env)
            .await
            .map_err(io_error(&env))?;
        for server in servers {
            file.write_all(format!("{}\n", member_line(server)).as_bytes())
                .await
                .map_err(io_error(&env))?;
        }
        file.flush().await.map_err(io_error(&env))?;
        Ok(compose)
    }

    /// Drops a worker's membership line. A missing file is not an error.
    pub async fn remove_member(
        &self,
        user_name: &str,
        cluster_name: &str,
        hostname: &str,
    ) -> Result<()> {
        let env = self.env_file(user_name, cluster_name);
        if !path_exists(&env).await {
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&env)
            .await
            .map_err(io_error(&env))?;
        let prefix = format!("{}=", hostname);
        let kept: String = content
            .lines()
            .filter(|line| !line.starts_with(&prefix))
            .map(|line| format!("{}\n", line))
            .collect();
        tokio::fs::write(&env, kept)
            .await
            .map_err(io_error(&env))?;
        Ok(())
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ClusterError + '_ {
    move |e| ClusterError::ProvisioningError(format!("{}: {}", path.display(), e))
}
