//! CADP peer endpoint.
//!
//! One route per peer: `POST /cadp` takes a CADP message and answers with a
//! CADP message. Transport-level trust is encoded by the sender's peer
//! entry; this adapter only parses, delegates, and replies.

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::domain::models::CadpMessage;
use crate::services::FederationService;

/// The CADP HTTP server for one federation instance.
#[derive(Clone)]
pub struct CadpServer {
    hostname: String,
    port: u16,
    federation: Arc<FederationService>,
}

impl CadpServer {
    pub fn new(hostname: impl Into<String>, port: u16, federation: Arc<FederationService>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            federation,
        }
    }

    /// Build the router.
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/cadp", post(handle_cadp))
            .route("/cadp/health", get(health))
            .with_state(Arc::clone(&self.federation))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(
        &self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.hostname, self.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("CADP endpoint listening on {addr}");
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn handle_cadp(
    State(federation): State<Arc<FederationService>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    // Malformed messages still get a CADP-shaped error answer.
    let message: CadpMessage = match serde_json::from_value(body) {
        Ok(message) => message,
        Err(e) => {
            let error = CadpMessage::new(
                crate::domain::models::CadpMessageType::Error,
                federation.peer_id(),
                json!({ "error": format!("malformed CADP message: {e}") }),
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(error).unwrap_or_default()),
            );
        }
    };

    let reply = federation.handle_message(message).await;
    (
        StatusCode::OK,
        Json(serde_json::to_value(reply).unwrap_or_default()),
    )
}

async fn health(State(federation): State<Arc<FederationService>>) -> Json<Value> {
    let stats = federation.stats().await;
    Json(json!({
        "status": "ok",
        "peerId": federation.peer_id(),
        "peers": stats.peers,
        "connectedPeers": stats.connected_peers,
    }))
}
