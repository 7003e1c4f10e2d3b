//! REST API for cluster management.
//!
//! # Endpoints
//!
//! ## Clusters
//! - `POST /v1/cluster` - Create a cluster
//! - `GET /v1/cluster` - List clusters
//!   (`skip`, `limit`, `sort`, `count`, `name`, `user_id`, `status`)
//! - `DELETE /v1/cluster` - Delete clusters by `{"ids": [...]}` body or `?user_id=`
//! - `GET /v1/cluster/validate?userid=&clustername=` - Check a cluster name
//! - `GET /v1/cluster/:id` - Get a cluster
//! - `DELETE /v1/cluster/:id` - Delete a cluster
//!
//! ## Hosts
//! - `GET /v1/cluster/:id/hosts` - List hosts (`skip`, `limit`, `sort`, `count`, `status`)
//! - `POST /v1/cluster/:id/hosts?number=N` - Add N hosts
//! - `DELETE /v1/cluster/:id/hosts` - Remove hosts listed in a `{"host_ids": [...]}` body
//! - `GET /v1/cluster/:id/hosts/:host_id` - Get a host
//!
//! ## Deployment module
//! - `POST /v1/deploy` / `DELETE /v1/deploy` - Build / remove a whole cluster
//! - `POST /v1/deploy/nodes` / `DELETE /v1/deploy/nodes` - Add / remove workers
//!
//! Every response is `{"success": true, "data": ...}` or
//! `{"success": false, "error": {"code", "message", "stage"?}}`. List
//! endpoints called with `count=true` also return the total in `X-Object-Count`.
//!
//! # Authentication
//!
//! Cluster and host endpoints take an identity token in `X-Auth-Token` or
//! `Authorization: Bearer`. `/health` and the deployment module routes are
//! unauthenticated.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use auth::{AuthConfig, TOKEN_HEADER};
pub use error::{ApiError, ApiResult, Envelope, ErrorBody};
pub use routes::{build_router, ApiServer, ApiServerConfig};
pub use state::ApiState;
