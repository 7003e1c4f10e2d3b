use async_trait::async_trait;
use cluster_shared_types::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use state_store_interface::Filter;
use std::fmt;

pub mod http;
pub mod static_identity;

pub use http::HttpIdentityService;
pub use static_identity::StaticIdentityService;

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateCluster,
    GetCluster,
    UpdateCluster,
    DeleteCluster,
    CreateHost,
    GetHost,
    UpdateHost,
    DeleteHost,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateCluster => "create_cluster",
            Action::GetCluster => "get_cluster",
            Action::UpdateCluster => "update_cluster",
            Action::DeleteCluster => "delete_cluster",
            Action::CreateHost => "create_host",
            Action::GetHost => "get_host",
            Action::UpdateHost => "update_host",
            Action::DeleteHost => "delete_host",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cluster,
    Host,
}

/// Directory entry for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    pub tenant_id: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Identity service unreachable: {0}")]
    Unreachable(String),
    #[error("Unexpected identity service response: {0}")]
    UnexpectedResponse(String),
}

impl From<IdentityError> for ClusterError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidToken => ClusterError::Unauthorized(err.to_string()),
            IdentityError::UserNotFound(id) => ClusterError::not_found("User", id),
            other => ClusterError::IdentityError(other.to_string()),
        }
    }
}

/// Token validation, authorization and user directory.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<()>;

    /// Whether `token` may perform `action`, optionally on one resource.
    async fn authorize(
        &self,
        action: Action,
        token: &str,
        resource_id: Option<&str>,
        kind: ResourceKind,
    ) -> Result<bool>;

    /// Store selector restricting reads to what `token` may see.
    async fn build_auth_filter(&self, action: Action, token: &str) -> Result<Filter>;

    async fn resolve_user(&self, user_id: &str, token: &str) -> Result<UserInfo>;

    /// The user the token was issued to.
    async fn token_owner(&self, token: &str) -> Result<UserInfo>;
}
