//! CLI-based machine provisioner.
//!
//! Machines are created and addressed through `docker-machine`; the composed
//! scheduler stack is sized with `docker-compose` against the swarm leader.
//!
//! # Requirements
//!
//! - `docker-machine`, `docker-compose` and `docker` binaries in PATH
//! - credentials for the configured cloud provider
//! - the platform SSH key installer script and public key on local disk
//!
//! Provisioning state for a cluster lives at
//! `{storage_root}/{user}/{cluster}` and is passed to every command with
//! `--storage-path`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cluster_shared_types::{ProviderType, Result, Server};
use provisioning_interface::{ComposeScale, MachineSpec, Provisioner, ProvisioningError};

/// Port the coordination service listens on.
pub const CONSUL_PORT: u16 = 8500;

/// Configuration for DockerMachineProvisioner.
#[derive(Debug, Clone)]
pub struct DockerMachineConfig {
    /// Path to docker-machine binary (default: "docker-machine")
    pub machine_binary: PathBuf,
    /// Path to docker-compose binary (default: "docker-compose")
    pub compose_binary: PathBuf,
    /// Path to docker binary (default: "docker")
    pub docker_binary: PathBuf,
    /// Root of per-cluster provisioning state
    pub storage_root: PathBuf,
    /// Script that installs a public key on a remote machine
    pub ssh_key_script: PathBuf,
    /// Platform public key installed on every machine
    pub platform_public_key: PathBuf,
    /// Timeout for a single command (default: 15m, machine creation is slow)
    pub command_timeout: Duration,
}

impl Default for DockerMachineConfig {
    fn default() -> Self {
        Self {
            machine_binary: PathBuf::from("docker-machine"),
            compose_binary: PathBuf::from("docker-compose"),
            docker_binary: PathBuf::from("docker"),
            storage_root: PathBuf::from("/linker/docker"),
            ssh_key_script: PathBuf::from("/linker/copy-ssh-id.sh"),
            platform_public_key: PathBuf::from("/linker/key/id_rsa.pub"),
            command_timeout: Duration::from_secs(900),
        }
    }
}

/// Provisioner backed by the docker-machine CLI.
pub struct DockerMachineProvisioner {
    config: DockerMachineConfig,
}

impl DockerMachineProvisioner {
    pub fn new(config: DockerMachineConfig) -> Self {
        Self { config }
    }

    /// Verify the docker-machine binary exists and is executable.
    pub async fn verify_binary(&self) -> std::result::Result<(), ProvisioningError> {
        let version = self
            .exec(&self.config.machine_binary, &["--version".to_string()], &[])
            .await?;
        info!("docker-machine version: {}", version.trim());
        Ok(())
    }

    // ==================== CLI Helper Methods ====================

    /// Execute a command with timeout and return its stdout.
    async fn exec(
        &self,
        program: &Path,
        args: &[String],
        envs: &[(String, String)],
    ) -> std::result::Result<String, ProvisioningError> {
        let cmd_str = format!("{} {}", program.display(), redact(args).join(" "));
        debug!("Executing: {}", cmd_str);

        let output = tokio::time::timeout(
            self.config.command_timeout,
            Command::new(program)
                .args(args)
                .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| ProvisioningError::Timeout(cmd_str.clone()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisioningError::CommandFailed {
                command: cmd_str,
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// docker-machine --storage-path <path> <args...>
    async fn machine(
        &self,
        storage_path: &str,
        args: &[&str],
    ) -> std::result::Result<String, ProvisioningError> {
        let mut full = vec!["--storage-path".to_string(), storage_path.to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.exec(&self.config.machine_binary, &full, &[]).await
    }

    /// docker-machine inspect <host> -f {{<key>}}
    async fn inspect(
        &self,
        hostname: &str,
        key: &str,
        storage_path: &str,
    ) -> std::result::Result<String, ProvisioningError> {
        let format = format!("{{{{{}}}}}", key);
        let output = self
            .machine(storage_path, &["inspect", hostname, "-f", &format])
            .await?;
        Ok(output.trim().to_string())
    }

    async fn machine_ip(
        &self,
        hostname: &str,
        storage_path: &str,
    ) -> std::result::Result<String, ProvisioningError> {
        let output = self.machine(storage_path, &["ip", hostname]).await?;
        Ok(output.trim().to_string())
    }

    /// Point the machine's own hostname at its private address.
    async fn change_host(
        &self,
        hostname: &str,
        private_ip: &str,
        storage_path: &str,
    ) -> std::result::Result<(), ProvisioningError> {
        let command = hosts_entry_command(hostname, private_ip);
        self.machine(storage_path, &["ssh", hostname, &command])
            .await
            .map(|_| ())
    }

    /// Install the platform key so management tooling can reach the machine.
    async fn replace_key(
        &self,
        hostname: &str,
        ssh_user: &str,
        public_ip: &str,
        storage_path: &str,
    ) -> std::result::Result<(), ProvisioningError> {
        let script = format!(
            "eval `ssh-agent` && ssh-add {}/machines/{}/id_rsa && {} {} {} {}",
            storage_path,
            hostname,
            self.config.ssh_key_script.display(),
            ssh_user,
            public_ip,
            self.config.platform_public_key.display()
        );
        self.exec(Path::new("sh"), &["-c".to_string(), script], &[])
            .await
            .map(|_| ())
    }

    /// Environment for a docker client talking to the swarm leader.
    async fn swarm_env(
        &self,
        swarm_master: &str,
        storage_path: &str,
    ) -> std::result::Result<Vec<(String, String)>, ProvisioningError> {
        let output = self
            .machine(storage_path, &["env", "--swarm", swarm_master, "--shell", "bash"])
            .await?;
        let envs = parse_env_exports(&output);
        if envs.is_empty() {
            return Err(ProvisioningError::InvalidOutput(format!(
                "no environment exported for swarm {}",
                swarm_master
            )));
        }
        Ok(envs)
    }
}

#[async_trait]
impl Provisioner for DockerMachineProvisioner {
    async fn create_machine(&self, spec: &MachineSpec) -> Result<Server> {
        let hostname = format!("{}.{}.{}", spec.user_name, spec.cluster_name, Uuid::new_v4());
        let storage_path = self.storage_path(&spec.user_name, &spec.cluster_name);
        tokio::fs::create_dir_all(&storage_path)
            .await
            .map_err(ProvisioningError::from)?;

        let consul_ip = match (&spec.consul_host, spec.swarm || spec.swarm_master) {
            (Some(consul), true) => Some(self.machine_ip(consul, &storage_path).await?),
            (None, true) => {
                return Err(ProvisioningError::InvalidOutput(
                    "swarm member requested without a coordination host".to_string(),
                )
                .into())
            }
            _ => None,
        };

        info!(
            host = %hostname,
            driver = spec.provider.provider.provider_type.driver(),
            "Creating machine"
        );
        let mut args = vec!["--storage-path".to_string(), storage_path.clone()];
        args.extend(create_args(&hostname, spec, consul_ip.as_deref()));
        self.exec(&self.config.machine_binary, &args, &[]).await?;

        let ip_address = self
            .inspect(&hostname, ".Driver.IPAddress", &storage_path)
            .await?;
        let private_ip_address = self
            .inspect(&hostname, ".Driver.PrivateIPAddress", &storage_path)
            .await?;

        let mut server = Server {
            hostname: hostname.clone(),
            ip_address,
            private_ip_address,
            storage_path: storage_path.clone(),
            ..Default::default()
        };

        // hosts entry first so docker-machine can reach the machine by name
        self.change_host(&hostname, &server.private_ip_address, &storage_path)
            .await?;

        match self
            .replace_key(
                &hostname,
                &spec.provider.provider.ssh_user,
                &server.ip_address,
                &storage_path,
            )
            .await
        {
            Ok(()) => server.is_fullfilled = true,
            Err(e) => warn!(host = %hostname, error = %e, "Platform key installation failed"),
        }

        Ok(server)
    }

    async fn delete_machine(&self, hostname: &str, storage_path: &str) -> Result<()> {
        info!(host = %hostname, "Deleting machine");
        self.machine(storage_path, &["rm", "-y", hostname]).await?;
        Ok(())
    }

    async fn run_on_machine(
        &self,
        hostname: &str,
        command: &str,
        storage_path: &str,
    ) -> Result<String> {
        Ok(self
            .machine(storage_path, &["ssh", hostname, command])
            .await?)
    }

    async fn copy_to_machine(
        &self,
        hostname: &str,
        local_path: &Path,
        remote_path: &str,
        storage_path: &str,
    ) -> Result<()> {
        let local = local_path.to_string_lossy();
        let remote = format!("{}:{}", hostname, remote_path);
        self.machine(storage_path, &["scp", &local, &remote]).await?;
        Ok(())
    }

    async fn boot_coordination(&self, server: &Server) -> Result<()> {
        let config = self
            .machine(&server.storage_path, &["config", &server.hostname])
            .await?;
        let mut args = parse_config_flags(&config);
        let port = format!("{}:{}", CONSUL_PORT, CONSUL_PORT);
        args.extend(
            [
                "run",
                "-d",
                "-p",
                &port,
                "--name",
                "consul",
                "-h",
                "consul",
                "progrium/consul",
                "-server",
                "-bootstrap",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        info!(host = %server.hostname, "Booting coordination service");
        self.exec(&self.config.docker_binary, &args, &[]).await?;
        Ok(())
    }

    async fn compose_scale(&self, scale: &ComposeScale) -> Result<()> {
        let envs = self
            .swarm_env(&scale.swarm_master, &scale.storage_path)
            .await?;
        let args = compose_args(&scale.compose_file, scale.workers);
        info!(
            swarm = %scale.swarm_master,
            workers = scale.workers,
            "Scaling composed cluster"
        );
        self.exec(&self.config.compose_binary, &args, &envs).await?;
        Ok(())
    }

    fn storage_path(&self, user_name: &str, cluster_name: &str) -> String {
        self.config
            .storage_root
            .join(user_name)
            .join(cluster_name)
            .to_string_lossy()
            .to_string()
    }
}

/// Arguments following `--storage-path <path>` for `docker-machine create`.
fn create_args(hostname: &str, spec: &MachineSpec, consul_ip: Option<&str>) -> Vec<String> {
    let provider = &spec.provider;
    let ssh_user = provider.provider.ssh_user.as_str();
    let mut args: Vec<String> = vec!["create".into(), "--driver".into()];
    args.push(provider.provider.provider_type.driver().to_string());

    let mut flag = |name: &str, value: &str| {
        args.push(name.to_string());
        args.push(value.to_string());
    };

    match provider.provider.provider_type {
        ProviderType::Openstack => {
            let os = &provider.openstack_info;
            flag("--openstack-auth-url", &os.auth_url);
            flag("--openstack-username", &os.username);
            flag("--openstack-password", &os.password);
            flag("--openstack-tenant-name", &os.tenant_name);
            flag("--openstack-flavor-name", &os.flavor_name);
            flag("--openstack-image-name", &os.image_name);
            if !ssh_user.is_empty() {
                flag("--openstack-ssh-user", ssh_user);
            }
            flag("--openstack-sec-groups", &os.security_group);
            flag("--openstack-floatingip-pool", &os.ip_pool_name);
            flag("--openstack-nova-network", &os.nova_network);
        }
        ProviderType::AmazonEc2 => {
            let aws = &provider.aws_ec2_info;
            flag("--amazonec2-access-key", &aws.access_key);
            flag("--amazonec2-secret-key", &aws.secret_key);
            flag("--amazonec2-region", &aws.region);
            flag("--amazonec2-vpc-id", &aws.vpc_id);
            flag("--amazonec2-ssh-user", ssh_user);
            flag("--amazonec2-instance-type", &aws.instance_type);
            if !aws.image_id.is_empty() {
                flag("--amazonec2-ami", &aws.image_id);
            }
            if !aws.root_size.is_empty() {
                flag("--amazonec2-root-size", &aws.root_size);
            }
        }
    }

    if spec.swarm {
        args.push("--swarm".into());
    }
    if spec.swarm_master {
        args.push("--swarm-master".into());
    }
    if let Some(ip) = consul_ip {
        args.push("--swarm-discovery".into());
        args.push(format!("consul://{}:{}", ip, CONSUL_PORT));
    }
    for label in &spec.labels {
        args.push(format!("--engine-label={}={}", label.key, label.value));
    }
    args.push(hostname.to_string());
    args
}

fn compose_args(compose_file: &Path, workers: u32) -> Vec<String> {
    vec![
        "-f".to_string(),
        compose_file.to_string_lossy().to_string(),
        "scale".to_string(),
        "zookeeper=3".to_string(),
        "mesosmaster=3".to_string(),
        "marathon=3".to_string(),
        format!("mesosslave={}", workers),
    ]
}

/// Shell snippet that maps `hostname` to `ip` in /etc/hosts, replacing the
/// distribution's 127.0.1.1 alias when the name is already listed.
fn hosts_entry_command(hostname: &str, ip: &str) -> String {
    format!(
        "if grep -xq .*{host} /etc/hosts; then \
           if grep -xq 127.0.1.1.* /etc/hosts; then \
             sudo sed -i 's/^127.0.1.1.*/{ip} {host}/g' /etc/hosts; \
           else echo '{ip} {host}' | sudo tee -a /etc/hosts; fi; \
         else echo '{ip} {host}' | sudo tee -a /etc/hosts; fi",
        host = hostname,
        ip = ip
    )
}

/// Parse `export KEY="value"` lines from `docker-machine env`.
fn parse_env_exports(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("export "))
        .filter_map(|assignment| assignment.split_once('='))
        .map(|(key, value)| (key.to_string(), value.trim_matches('"').to_string()))
        .collect()
}

/// Split `docker-machine config` output into docker client flags.
fn parse_config_flags(output: &str) -> Vec<String> {
    output
        .split_whitespace()
        .map(|flag| flag.replace('"', ""))
        .collect()
}

/// Hide credential values when logging a command line.
fn redact(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            redacted.push("****".to_string());
            hide_next = false;
            continue;
        }
        hide_next = arg.ends_with("-password") || arg.ends_with("-secret-key");
        redacted.push(arg.clone());
    }
    redacted
}
