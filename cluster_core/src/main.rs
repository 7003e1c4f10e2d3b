//! Cluster management service.
//!
//! Serves the cluster and host REST API and runs the deployment workflows.
//! The same process also serves the `/v1/deploy` routes of the deployment
//! module, so one binary can act as a cluster manager, a deployment module
//! for other managers (`DEPLOY_MODULE_URL`), or both.
//!
//! Configuration is read from the environment; see [`cluster_core::config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn, Level};

use cluster_core::api::{ApiServer, ApiServerConfig, ApiState, AuthConfig};
use cluster_core::config::{ProvisionerKind, ServiceConfig};
use cluster_core::deploy::{DeployService, Deployer, RemoteDeployer};
use cluster_core::topology::TopologyComposer;
use cluster_core::{start_cluster_service, ServiceOptions};
use identity_interface::{HttpIdentityService, IdentityService, StaticIdentityService, UserInfo};
use observability::{init_tracing, parse_level, TracingConfig};
use provisioner::{DockerMachineProvisioner, MockProvisioner, Provisioner};
use scheduler_interface::{MarathonClient, SchedulerClient};
use state_store_interface::{create_state_store, StateStoreConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    let level = parse_level(&config.log_level).unwrap_or(Level::INFO);
    init_tracing(
        TracingConfig::new("cluster-service")
            .with_level(level)
            .with_json(config.log_json),
    )
    .context("Failed to initialize tracing")?;

    info!(
        api_port = config.api_port,
        provisioner = ?config.provisioner,
        deploy_module = config.deploy_module_url.as_deref().unwrap_or("in-process"),
        "Starting cluster service"
    );

    let store = create_state_store(StateStoreConfig::InMemory)
        .context("Failed to create state store")?;
    store
        .initialize()
        .await
        .context("Failed to initialize state store")?;

    let identity = build_identity(&config).await;

    let provisioner: Arc<dyn Provisioner> = match config.provisioner {
        ProvisionerKind::DockerMachine => {
            let provisioner = DockerMachineProvisioner::new(config.docker_machine_config());
            if let Err(e) = provisioner.verify_binary().await {
                warn!(error = %e, "docker-machine is not usable, deployments will fail");
            }
            Arc::new(provisioner)
        }
        ProvisionerKind::Mock => {
            warn!("Using the mock provisioner, no machines will be created");
            Arc::new(MockProvisioner::new())
        }
    };
    let scheduler: Arc<dyn SchedulerClient> = Arc::new(MarathonClient::new());
    let local: Arc<dyn DeployService> = Arc::new(Deployer::new(
        provisioner,
        scheduler,
        TopologyComposer::new(&config.compose_root, &config.template_dir),
        config.deployer_config(),
    ));

    let workflows: Arc<dyn DeployService> = match &config.deploy_module_url {
        Some(url) => Arc::new(RemoteDeployer::new(url)),
        None => local.clone(),
    };

    let mut options = ServiceOptions::from(&config);
    options.provider = config
        .provider_info()
        .context("Failed to load provider configuration")?;
    let service = start_cluster_service(store.clone(), identity.clone(), workflows, options);

    let auth_config = if config.auth_disabled {
        warn!("Authentication disabled, unauthenticated requests run as the service");
        AuthConfig::disabled()
    } else {
        AuthConfig::default()
    };
    let state = ApiState::new(store, service.clusters.clone(), identity, local, auth_config);
    let server = ApiServer::bind(&ApiServerConfig::with_port(config.api_port), state)
        .await
        .context("Failed to bind API listener")?;
    let served = server.serve(shutdown_signal()).await;
    service.shutdown();
    served.context("API server failed")?;

    info!("Cluster service stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => warn!(error = %e, "Failed to listen for ctrl+c, stopping now"),
    }
}

async fn build_identity(config: &ServiceConfig) -> Arc<dyn IdentityService> {
    if let Some(url) = &config.identity_url {
        info!(identity_url = %url, "Using identity service");
        return Arc::new(HttpIdentityService::new(url));
    }

    let identity = StaticIdentityService::new();
    match &config.admin_token {
        Some(token) => {
            identity
                .add_user(
                    token.clone(),
                    UserInfo {
                        user_id: "admin".to_string(),
                        username: "admin".to_string(),
                        tenant_id: "sysadmin".to_string(),
                        email: String::new(),
                    },
                    true,
                )
                .await;
            info!("Using static identity with the configured admin token");
        }
        None => warn!("No IDENTITY_URL or ADMIN_TOKEN, every token will be rejected"),
    }
    Arc::new(identity)
}
