//! In-process identity service backed by a fixed token table.
//!
//! Used for development deployments without a user-management service and
//! throughout the test suites.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use cluster_shared_types::Result;
use state_store_interface::Filter;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Action, IdentityError, IdentityService, ResourceKind, UserInfo};

#[derive(Debug, Clone)]
struct Grant {
    user: UserInfo,
    admin: bool,
    denied: HashSet<Action>,
}

/// Admin tokens see everything; other tokens are scoped to their own records.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityService {
    grants: Arc<RwLock<HashMap<String, Grant>>>,
    users: Arc<RwLock<HashMap<String, UserInfo>>>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and issue `token` for them.
    pub async fn add_user(&self, token: impl Into<String>, user: UserInfo, admin: bool) {
        self.users
            .write()
            .await
            .insert(user.user_id.clone(), user.clone());
        self.grants.write().await.insert(
            token.into(),
            Grant {
                user,
                admin,
                denied: HashSet::new(),
            },
        );
    }

    /// Withhold a single action from a token.
    pub async fn deny(&self, token: &str, action: Action) {
        if let Some(grant) = self.grants.write().await.get_mut(token) {
            grant.denied.insert(action);
        }
    }

    async fn grant(&self, token: &str) -> Result<Grant> {
        self.grants
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| IdentityError::InvalidToken.into())
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn validate_token(&self, token: &str) -> Result<()> {
        self.grant(token).await.map(|_| ())
    }

    async fn authorize(
        &self,
        action: Action,
        token: &str,
        resource_id: Option<&str>,
        kind: ResourceKind,
    ) -> Result<bool> {
        let grant = self.grant(token).await?;
        let allowed = grant.admin || !grant.denied.contains(&action);
        debug!(
            action = %action,
            ?kind,
            resource = resource_id.unwrap_or("-"),
            allowed,
            "Static authorization decision"
        );
        Ok(allowed)
    }

    async fn build_auth_filter(&self, _action: Action, token: &str) -> Result<Filter> {
        let grant = self.grant(token).await?;
        if grant.admin {
            Ok(Filter::All)
        } else {
            Ok(Filter::eq("user_id", grant.user.user_id))
        }
    }

    async fn resolve_user(&self, user_id: &str, token: &str) -> Result<UserInfo> {
        self.grant(token).await?;
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdentityError::UserNotFound(user_id.to_string()).into())
    }

    async fn token_owner(&self, token: &str) -> Result<UserInfo> {
        Ok(self.grant(token).await?.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_shared_types::ClusterError;

    fn alice() -> UserInfo {
        UserInfo {
            user_id: "u-alice".into(),
            username: "alice".into(),
            tenant_id: "t-1".into(),
            email: "alice@example.com".into(),
        }
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let identity = StaticIdentityService::new();
        let err = identity.validate_token("nope").await.unwrap_err();
        assert!(matches!(err, ClusterError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_user_scoped_filter() {
        let identity = StaticIdentityService::new();
        identity.add_user("tok-a", alice(), false).await;

        let filter = identity
            .build_auth_filter(Action::GetCluster, "tok-a")
            .await
            .unwrap();
        assert_eq!(filter, Filter::eq("user_id", "u-alice"));

        let user = identity.resolve_user("u-alice", "tok-a").await.unwrap();
        assert_eq!(user.tenant_id, "t-1");
        assert!(identity.resolve_user("u-bob", "tok-a").await.is_err());
    }

    #[tokio::test]
    async fn test_denied_action() {
        let identity = StaticIdentityService::new();
        identity.add_user("tok-a", alice(), false).await;
        identity.deny("tok-a", Action::DeleteCluster).await;

        assert!(!identity
            .authorize(Action::DeleteCluster, "tok-a", Some("c1"), ResourceKind::Cluster)
            .await
            .unwrap());
        assert!(identity
            .authorize(Action::CreateCluster, "tok-a", None, ResourceKind::Cluster)
            .await
            .unwrap());
    }
}
