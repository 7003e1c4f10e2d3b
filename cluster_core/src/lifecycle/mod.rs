//! Cluster and host records and their status transitions.
//!
//! Every status change goes through `update_status` on the owning
//! lifecycle, which is a no-op when the record is already in the target
//! status. Request paths run as [`Actor::Token`] and are authorized against
//! the identity service; workflows run as [`Actor::System`].

pub mod clusters;
pub mod hosts;

pub use clusters::{ClusterLifecycle, ClusterQuery, ClusterUpdate, CreateCluster};
pub use hosts::{HostLifecycle, HostQuery, HostUpdate};

use chrono::{DateTime, SecondsFormat, Utc};
use cluster_shared_types::{ClusterError, LifecycleStatus, Result};
use identity_interface::{Action, IdentityService, ResourceKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use state_store_interface::Filter;

static CLUSTER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,255}$").expect("valid cluster name pattern"));

/// Who is performing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The service itself: workflows and the sweeper. Not authorized.
    System,
    /// A caller presenting an identity token.
    Token(String),
}

impl Actor {
    pub fn token(token: impl Into<String>) -> Self {
        Actor::Token(token.into())
    }

    fn require_token(&self) -> Result<&str> {
        match self {
            Actor::Token(token) => Ok(token),
            Actor::System => Err(ClusterError::Unauthorized(
                "operation requires a user token".to_string(),
            )),
        }
    }
}

/// Result of a status transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Unchanged,
}

/// Status selector accepted by list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Is(LifecycleStatus),
    Unterminated,
}

impl StatusFilter {
    pub fn parse(value: &str) -> Result<Self> {
        if value == "unterminated" {
            Ok(StatusFilter::Unterminated)
        } else {
            value.parse().map(StatusFilter::Is)
        }
    }

    fn to_filter(self) -> Filter {
        match self {
            StatusFilter::Is(status) => Filter::eq("status", status),
            StatusFilter::Unterminated => unterminated(),
        }
    }
}

pub(crate) fn unterminated() -> Filter {
    Filter::ne("status", LifecycleStatus::Terminated)
}

/// Cluster names become a directory under the compose root, so a name made
/// only of dots is refused.
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if CLUSTER_NAME.is_match(name) && !name.chars().all(|c| c == '.') {
        Ok(())
    } else {
        Err(ClusterError::Validation(format!(
            "invalid cluster name '{}': 1-255 letters, digits, '_', '.' or '-', not only dots",
            name
        )))
    }
}

/// Checks `action` for the actor; the system actor is always allowed.
pub(crate) async fn authorize(
    identity: &dyn IdentityService,
    actor: &Actor,
    action: Action,
    resource_id: Option<&str>,
    kind: ResourceKind,
) -> Result<()> {
    let Actor::Token(token) = actor else {
        return Ok(());
    };
    if identity.authorize(action, token, resource_id, kind).await? {
        Ok(())
    } else {
        Err(ClusterError::Unauthorized(format!(
            "{} is not allowed",
            action
        )))
    }
}

/// Selector limiting what the actor may see for `action`.
pub(crate) async fn scope(
    identity: &dyn IdentityService,
    actor: &Actor,
    action: Action,
) -> Result<Filter> {
    match actor {
        Actor::System => Ok(Filter::All),
        Actor::Token(token) => identity.build_auth_filter(action, token).await,
    }
}

/// Timestamp in the same form serde writes record timestamps.
pub(crate) fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub(crate) fn status_fields(status: LifecycleStatus, now: DateTime<Utc>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("status".to_string(), Value::from(status.as_str()));
    fields.insert("time_update".to_string(), timestamp(now));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_name_pattern() {
        assert!(validate_cluster_name("web-01_prod.v2").is_ok());
        assert!(validate_cluster_name("").is_err());
        assert!(validate_cluster_name("has space").is_err());
        assert!(validate_cluster_name(&"a".repeat(255)).is_ok());
        assert!(validate_cluster_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_dot_only_names_rejected() {
        for name in [".", "..", "..."] {
            assert!(validate_cluster_name(name).is_err(), "{name}");
        }
        assert!(validate_cluster_name(".web").is_ok());
        assert!(validate_cluster_name("v1.2").is_ok());
    }

    #[test]
    fn test_status_filter() {
        assert_eq!(
            StatusFilter::parse("unterminated").unwrap(),
            StatusFilter::Unterminated
        );
        assert_eq!(
            StatusFilter::parse("RUNNING").unwrap(),
            StatusFilter::Is(LifecycleStatus::Running)
        );
        assert!(StatusFilter::parse("gone").is_err());

        let filter = StatusFilter::Unterminated.to_filter();
        assert!(filter.matches(&serde_json::json!({"status": "FAILED"})));
        assert!(!filter.matches(&serde_json::json!({"status": "TERMINATED"})));
    }
}
