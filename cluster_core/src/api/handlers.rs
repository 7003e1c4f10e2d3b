//! API request handlers.

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use cluster_shared_types::{
    AddNodeRequest, Cluster, ClusterError, DeleteRequest, DeployRequest, Host, HostId, NodeBatch,
    Server,
};
use state_store_interface::{Page, QueryOptions};

use super::error::{ApiError, ApiResult, Envelope};
use super::state::ApiState;
use crate::lifecycle::{Actor, ClusterQuery, CreateCluster, HostQuery, StatusFilter};

/// Set to the total number of matches when a list is requested with `count=true`.
pub static OBJECT_COUNT: HeaderName = HeaderName::from_static("x-object-count");

// ============================================================================
// Request types
// ============================================================================

/// Paging parameters shared by the list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub sort: Option<String>,
    #[serde(default)]
    pub count: bool,
    pub status: Option<String>,
    /// Cluster listings only.
    pub name: Option<String>,
    /// Cluster listings only.
    pub user_id: Option<String>,
}

impl ListParams {
    fn options(&self) -> QueryOptions {
        QueryOptions {
            skip: self.skip.unwrap_or(0),
            limit: self.limit.filter(|l| *l > 0),
            sort: self.sort.clone().filter(|s| !s.is_empty()),
        }
    }

    fn status(&self) -> ApiResult<Option<StatusFilter>> {
        match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Ok(Some(StatusFilter::parse(raw)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteClustersParams {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteClustersBody {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateParams {
    pub userid: Option<String>,
    pub clustername: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddHostsParams {
    pub number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteHostsBody {
    pub host_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_id(kind: &str, raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::bad_request(format!("invalid {} id '{}'", kind, raw)))
}

fn parse_ids(kind: &str, raw: &[String]) -> ApiResult<Vec<Uuid>> {
    raw.iter().map(|id| parse_id(kind, id)).collect()
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    params
        .map(|Query(params)| params)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// Parses an optional JSON body; DELETE requests may carry none.
fn optional_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope::ok(data)).into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(Envelope::ok(data))).into_response()
}

fn page_response<T: Serialize>(page: Page<T>, count: bool) -> Response {
    let mut response = ok(page.items);
    if count {
        response
            .headers_mut()
            .insert(OBJECT_COUNT.clone(), HeaderValue::from(page.total));
    }
    response
}

// ============================================================================
// Health
// ============================================================================

pub async fn health(State(state): State<ApiState>) -> ApiResult<Response> {
    match state.state_store.health_check().await {
        Ok(true) => Ok(ok(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })),
        Ok(false) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "UPSTREAM_ERROR",
            "state store is unhealthy",
        )),
        Err(e) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "UPSTREAM_ERROR",
            e.to_string(),
        )),
    }
}

// ============================================================================
// Clusters
// ============================================================================

pub async fn create_cluster(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<CreateCluster>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let cluster = state.clusters.create(request, &actor).await?;
    Ok(created(cluster))
}

pub async fn list_clusters(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Response> {
    let params = query_params(params)?;
    let query = ClusterQuery {
        name: params.name.clone().filter(|n| !n.is_empty()),
        user_id: params.user_id.clone().filter(|u| !u.is_empty()),
        status: params.status()?,
    };
    let page: Page<Cluster> = state
        .clusters
        .query(&query, &params.options(), &actor)
        .await?;
    Ok(page_response(page, params.count))
}

/// Deletes the clusters named in an `{"ids": [...]}` body, or every cluster
/// of the `user_id` query parameter.
pub async fn delete_clusters(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    params: Result<Query<DeleteClustersParams>, QueryRejection>,
    body: Bytes,
) -> ApiResult<Response> {
    let params = query_params(params)?;
    if let Some(user_id) = params.user_id.filter(|u| !u.is_empty()) {
        state.clusters.delete_by_user(&user_id, &actor).await?;
        return Ok(ok(()));
    }
    let body: DeleteClustersBody = optional_body(&body)?
        .ok_or_else(|| ApiError::bad_request("either an ids body or user_id is required"))?;
    let ids = parse_ids("cluster", &body.ids)?;
    state.clusters.delete_by_ids(&ids, &actor).await?;
    Ok(ok(()))
}

pub async fn validate_cluster_name(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    params: Result<Query<ValidateParams>, QueryRejection>,
) -> ApiResult<Response> {
    let params = query_params(params)?;
    let (Some(user_id), Some(name)) = (params.userid, params.clustername) else {
        return Err(ApiError::bad_request("userid and clustername are required"));
    };
    state.clusters.check_name(&user_id, &name, &actor).await?;
    Ok(ok(()))
}

pub async fn get_cluster(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    Path(cluster_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id("cluster", &cluster_id)?;
    Ok(ok(state.clusters.get(id, &actor).await?))
}

pub async fn delete_cluster(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    Path(cluster_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id("cluster", &cluster_id)?;
    Ok(ok(state.clusters.delete(id, &actor).await?))
}

// ============================================================================
// Hosts
// ============================================================================

pub async fn list_hosts(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    Path(cluster_id): Path<String>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Response> {
    let id = parse_id("cluster", &cluster_id)?;
    let params = query_params(params)?;
    state.clusters.get(id, &actor).await?;
    let query = HostQuery {
        cluster_id: Some(id),
        status: params.status()?,
    };
    let page: Page<Host> = state.hosts.query(&query, &params.options(), &actor).await?;
    Ok(page_response(page, params.count))
}

pub async fn add_hosts(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    Path(cluster_id): Path<String>,
    params: Result<Query<AddHostsParams>, QueryRejection>,
) -> ApiResult<Response> {
    let id = parse_id("cluster", &cluster_id)?;
    let params = query_params(params)?;
    let number = params
        .number
        .ok_or_else(|| ApiError::bad_request("number is required"))?;
    let hosts = state.clusters.add_hosts(id, &number, &actor).await?;
    Ok(created(hosts))
}

pub async fn delete_hosts(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    Path(cluster_id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let id = parse_id("cluster", &cluster_id)?;
    let body: DeleteHostsBody = optional_body(&body)?
        .ok_or_else(|| ApiError::bad_request("a host_ids body is required"))?;
    let host_ids: Vec<HostId> = parse_ids("host", &body.host_ids)?;
    let hosts = state.clusters.terminate_hosts(id, &host_ids, &actor).await?;
    Ok(ok(hosts))
}

pub async fn get_host(
    State(state): State<ApiState>,
    Extension(actor): Extension<Actor>,
    Path((cluster_id, host_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let cluster_id = parse_id("cluster", &cluster_id)?;
    let host_id = parse_id("host", &host_id)?;
    let host = state.hosts.get(host_id, &actor).await?;
    if host.cluster_id != cluster_id {
        return Err(ClusterError::not_found("Host", host_id).into());
    }
    Ok(ok(host))
}

// ============================================================================
// Deployment module
// ============================================================================

pub async fn deploy_cluster(
    State(state): State<ApiState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let servers: Vec<Server> = state.deployer.create_cluster(&request).await?;
    Ok(ok(servers))
}

pub async fn undeploy_cluster(
    State(state): State<ApiState>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    state.deployer.delete_cluster(&request).await?;
    Ok(ok(()))
}

pub async fn deploy_nodes(
    State(state): State<ApiState>,
    payload: Result<Json<AddNodeRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let batch: NodeBatch = state.deployer.add_nodes(&request).await?;
    Ok(ok(batch))
}

pub async fn undeploy_nodes(
    State(state): State<ApiState>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let servers = state.deployer.delete_nodes(&request).await?;
    Ok(ok(servers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_options() {
        let params = ListParams {
            skip: Some(10),
            limit: Some(0),
            sort: Some("-time_create".into()),
            ..Default::default()
        };
        let options = params.options();
        assert_eq!(options.skip, 10);
        assert_eq!(options.limit, None);
        assert_eq!(options.sort.as_deref(), Some("-time_create"));
    }

    #[test]
    fn test_list_params_status() {
        let mut params = ListParams {
            status: Some("unterminated".into()),
            ..Default::default()
        };
        assert_eq!(params.status().unwrap(), Some(StatusFilter::Unterminated));

        params.status = Some("sleeping".into());
        assert_eq!(params.status().unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_optional_body() {
        let empty: Option<DeleteHostsBody> = optional_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(empty.is_none());

        let body: Option<DeleteHostsBody> =
            optional_body(&Bytes::from_static(br#"{"host_ids": ["a"]}"#)).unwrap();
        assert_eq!(body.unwrap().host_ids, vec!["a".to_string()]);

        assert!(optional_body::<DeleteHostsBody>(&Bytes::from_static(b"{")).is_err());
    }

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id("cluster", &id.to_string()).unwrap(), id);
        assert_eq!(
            parse_id("cluster", "nope").unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }
}
