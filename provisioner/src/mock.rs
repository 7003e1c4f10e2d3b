//! Mock provisioner for testing and development.
//!
//! Machines exist only in memory. Addresses are handed out sequentially
//! (`52.0.0.N` public, `10.0.0.N` private) so tests can predict them, and
//! individual operations can be made to fail.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use cluster_shared_types::{Result, Server};
use provisioning_interface::{ComposeScale, MachineSpec, Provisioner, ProvisioningError};

#[derive(Debug, Default)]
struct Failures {
    /// 1-based create calls that fail.
    create_calls: HashSet<usize>,
    create_all: bool,
    key_install: bool,
    delete_all: bool,
    delete_hosts: HashSet<String>,
    compose: bool,
    boot: bool,
    /// Commands containing any of these fragments fail.
    command_fragments: Vec<String>,
}

/// Provisioner that simulates machines in memory.
#[derive(Debug, Default)]
pub struct MockProvisioner {
    machines: Arc<RwLock<HashMap<String, Server>>>,
    specs: Arc<RwLock<Vec<MachineSpec>>>,
    commands: Arc<RwLock<Vec<(String, String)>>>,
    copies: Arc<RwLock<Vec<(String, String)>>>,
    compositions: Arc<RwLock<Vec<ComposeScale>>>,
    booted: Arc<RwLock<Vec<String>>>,
    deleted: Arc<RwLock<Vec<String>>>,
    failures: Arc<RwLock<Failures>>,
    next_address: AtomicU32,
    create_calls: AtomicUsize,
}

impl MockProvisioner {
    /// Create a new mock provisioner instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` (1-based) call to `create_machine` fail.
    pub async fn fail_create_call(&self, nth: usize) {
        self.failures.write().await.create_calls.insert(nth);
    }

    pub async fn fail_all_creates(&self) {
        self.failures.write().await.create_all = true;
    }

    /// Machines still get created but report `is_fullfilled = false`.
    pub async fn fail_key_install(&self) {
        self.failures.write().await.key_install = true;
    }

    pub async fn fail_all_deletes(&self) {
        self.failures.write().await.delete_all = true;
    }

    pub async fn fail_delete_of(&self, hostname: &str) {
        self.failures
            .write()
            .await
            .delete_hosts
            .insert(hostname.to_string());
    }

    pub async fn fail_compose(&self) {
        self.failures.write().await.compose = true;
    }

    pub async fn fail_boot(&self) {
        self.failures.write().await.boot = true;
    }

    /// Fail every remote command containing `fragment`.
    pub async fn fail_commands_containing(&self, fragment: &str) {
        self.failures
            .write()
            .await
            .command_fragments
            .push(fragment.to_string());
    }

    /// Get the count of live machines (for testing).
    pub async fn machine_count(&self) -> usize {
        self.machines.read().await.len()
    }

    pub async fn has_machine(&self, hostname: &str) -> bool {
        self.machines.read().await.contains_key(hostname)
    }

    /// Number of `create_machine` calls so far, failed ones included.
    pub fn create_call_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Specs of successfully created machines, in creation order.
    pub async fn created_specs(&self) -> Vec<MachineSpec> {
        self.specs.read().await.clone()
    }

    /// `(hostname, command)` pairs run so far.
    pub async fn commands(&self) -> Vec<(String, String)> {
        self.commands.read().await.clone()
    }

    /// `(hostname, remote_path)` pairs copied so far.
    pub async fn copies(&self) -> Vec<(String, String)> {
        self.copies.read().await.clone()
    }

    pub async fn compositions(&self) -> Vec<ComposeScale> {
        self.compositions.read().await.clone()
    }

    pub async fn booted(&self) -> Vec<String> {
        self.booted.read().await.clone()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.read().await.clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create_machine(&self, spec: &MachineSpec) -> Result<Server> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let failures = self.failures.read().await;
            if failures.create_all || failures.create_calls.contains(&call) {
                return Err(ProvisioningError::CommandFailed {
                    command: format!("create #{}", call),
                    message: "injected create failure".to_string(),
                }
                .into());
            }
        }

        if spec.swarm && spec.consul_host.is_none() {
            return Err(ProvisioningError::InvalidOutput(
                "swarm member requested without a coordination host".to_string(),
            )
            .into());
        }

        let n = self.next_address.fetch_add(1, Ordering::SeqCst) + 1;
        let hostname = format!("{}.{}.{}", spec.user_name, spec.cluster_name, n);
        let server = Server {
            hostname: hostname.clone(),
            ip_address: format!("52.0.{}.{}", n / 250, n % 250 + 1),
            private_ip_address: format!("10.0.{}.{}", n / 250, n % 250 + 1),
            storage_path: self.storage_path(&spec.user_name, &spec.cluster_name),
            is_fullfilled: !self.failures.read().await.key_install,
            ..Default::default()
        };

        info!("MockProvisioner: Created machine {}", hostname);
        self.machines
            .write()
            .await
            .insert(hostname, server.clone());
        self.specs.write().await.push(spec.clone());
        Ok(server)
    }

    async fn delete_machine(&self, hostname: &str, _storage_path: &str) -> Result<()> {
        {
            let failures = self.failures.read().await;
            if failures.delete_all || failures.delete_hosts.contains(hostname) {
                return Err(ProvisioningError::CommandFailed {
                    command: format!("rm -y {}", hostname),
                    message: "injected delete failure".to_string(),
                }
                .into());
            }
        }

        info!("MockProvisioner: Deleting machine {}", hostname);
        self.deleted.write().await.push(hostname.to_string());
        self.machines
            .write()
            .await
            .remove(hostname)
            .map(|_| ())
            .ok_or_else(|| ProvisioningError::MachineNotFound(hostname.to_string()).into())
    }

    async fn run_on_machine(
        &self,
        hostname: &str,
        command: &str,
        _storage_path: &str,
    ) -> Result<String> {
        if !self.has_machine(hostname).await {
            return Err(ProvisioningError::MachineNotFound(hostname.to_string()).into());
        }
        let failing = self
            .failures
            .read()
            .await
            .command_fragments
            .iter()
            .any(|fragment| command.contains(fragment.as_str()));
        if failing {
            return Err(ProvisioningError::CommandFailed {
                command: command.to_string(),
                message: "injected command failure".to_string(),
            }
            .into());
        }

        debug!("MockProvisioner: {} $ {}", hostname, command);
        self.commands
            .write()
            .await
            .push((hostname.to_string(), command.to_string()));
        Ok(String::new())
    }

    async fn copy_to_machine(
        &self,
        hostname: &str,
        local_path: &Path,
        remote_path: &str,
        _storage_path: &str,
    ) -> Result<()> {
        if !self.has_machine(hostname).await {
            return Err(ProvisioningError::MachineNotFound(hostname.to_string()).into());
        }
        if !local_path.exists() {
            return Err(ProvisioningError::InvalidOutput(format!(
                "local file {} does not exist",
                local_path.display()
            ))
            .into());
        }
        self.copies
            .write()
            .await
            .push((hostname.to_string(), remote_path.to_string()));
        Ok(())
    }

    async fn boot_coordination(&self, server: &Server) -> Result<()> {
        if self.failures.read().await.boot {
            return Err(ProvisioningError::CommandFailed {
                command: format!("run consul on {}", server.hostname),
                message: "injected boot failure".to_string(),
            }
            .into());
        }
        self.booted.write().await.push(server.hostname.clone());
        Ok(())
    }

    async fn compose_scale(&self, scale: &ComposeScale) -> Result<()> {
        if self.failures.read().await.compose {
            return Err(ProvisioningError::CommandFailed {
                command: format!("scale mesosslave={}", scale.workers),
                message: "injected compose failure".to_string(),
            }
            .into());
        }
        info!(
            "MockProvisioner: Scaling {} to {} workers",
            scale.swarm_master, scale.workers
        );
        self.compositions.write().await.push(scale.clone());
        Ok(())
    }

    fn storage_path(&self, user_name: &str, cluster_name: &str) -> String {
        format!("/mock/docker/{}/{}", user_name, cluster_name)
    }
}
