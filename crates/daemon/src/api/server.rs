/// API Server implementation

use super::handlers::*;
use onioncirc_core::LoopbackNetwork;
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::info;

/// API Server exposing guard statistics and circuit state
pub struct ApiServer {
    listen_addr: SocketAddr,
    network: Arc<RwLock<LoopbackNetwork>>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(listen_addr: SocketAddr, network: Arc<RwLock<LoopbackNetwork>>) -> Self {
        Self {
            listen_addr,
            network,
        }
    }

    /// Router with every endpoint, ready to serve
    pub fn router(&self) -> Router {
        let state = AppState {
            network: self.network.clone(),
        };

        Router::new()
            .route("/health", get(health_check))
            .route("/api/guards", get(get_guards))
            .route("/api/guards/:identity", get(get_guard))
            .route("/api/circuits", get(get_circuits))
            .route("/api/params", get(get_params))
            // Allow local dashboards on other origins
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Start the API server
    pub async fn start(self) -> Result<()> {
        let app = self.router();

        info!("API server starting on {}", self.listen_addr);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
