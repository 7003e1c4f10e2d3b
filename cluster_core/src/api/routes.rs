//! Router assembly and the listening server.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tokio::net::TcpListener;
use tracing::info;

use super::auth::auth_layer;
use super::handlers;
use super::state::ApiState;

/// Cluster routes behind token auth; health and deployment routes open.
pub fn build_router(state: ApiState) -> Router {
    let cluster_routes = Router::new()
        .route(
            "/",
            post(handlers::create_cluster)
                .get(handlers::list_clusters)
                .delete(handlers::delete_clusters),
        )
        .route("/validate", get(handlers::validate_cluster_name))
        .route(
            "/:cluster_id",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route(
            "/:cluster_id/hosts",
            get(handlers::list_hosts)
                .post(handlers::add_hosts)
                .delete(handlers::delete_hosts),
        )
        .route("/:cluster_id/hosts/:host_id", get(handlers::get_host));

    // Called by other instances acting as cluster managers, not by users
    let deploy_routes = Router::new()
        .route(
            "/",
            post(handlers::deploy_cluster).delete(handlers::undeploy_cluster),
        )
        .route(
            "/nodes",
            post(handlers::deploy_nodes).delete(handlers::undeploy_nodes),
        );

    let authenticated = Router::new()
        .nest("/v1/cluster", cluster_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_layer));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/v1/deploy", deploy_routes)
        .merge(authenticated)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Where the REST API listens.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self::with_port(8080)
    }
}

impl ApiServerConfig {
    /// All interfaces on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
        }
    }
}

/// A bound listener plus the state it serves.
pub struct ApiServer {
    listener: TcpListener,
    state: ApiState,
}

impl ApiServer {
    /// Binds the listener so address errors surface before any work starts.
    pub async fn bind(config: &ApiServerConfig, state: ApiState) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %self.local_addr()?, "REST API listening");
        axum::serve(self.listener, build_router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
    }
}
