//! API server state.

use std::sync::Arc;

use identity_interface::IdentityService;
use state_store_interface::StateStore;

use super::auth::AuthConfig;
use crate::deploy::DeployService;
use crate::lifecycle::{ClusterLifecycle, HostLifecycle};

/// Shared state for the API server.
#[derive(Clone)]
pub struct ApiState {
    /// Store backing the records, checked by `/health`.
    pub state_store: Arc<dyn StateStore>,
    pub clusters: Arc<ClusterLifecycle>,
    pub hosts: Arc<HostLifecycle>,
    /// Token validation for the auth middleware.
    pub identity: Arc<dyn IdentityService>,
    /// Backs the `/v1/deploy` routes.
    pub deployer: Arc<dyn DeployService>,
    pub auth_config: Arc<AuthConfig>,
}

impl ApiState {
    pub fn new(
        state_store: Arc<dyn StateStore>,
        clusters: Arc<ClusterLifecycle>,
        identity: Arc<dyn IdentityService>,
        deployer: Arc<dyn DeployService>,
        auth_config: AuthConfig,
    ) -> Self {
        Self {
            state_store,
            hosts: clusters.hosts().clone(),
            clusters,
            identity,
            deployer,
            auth_config: Arc::new(auth_config),
        }
    }

    /// Create API state with auth disabled.
    pub fn new_without_auth(
        state_store: Arc<dyn StateStore>,
        clusters: Arc<ClusterLifecycle>,
        identity: Arc<dyn IdentityService>,
        deployer: Arc<dyn DeployService>,
    ) -> Self {
        Self::new(
            state_store,
            clusters,
            identity,
            deployer,
            AuthConfig::disabled(),
        )
    }
}
