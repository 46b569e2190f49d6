//! Web server module.

mod handlers;

pub use handlers::*;

use crate::classify::Classifier;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::query::QueryEngine;
use crate::scheduler::{RetentionPolicy, Scheduler};
use crate::surveillance::SurveillanceManager;
use crate::telemetry::EntityRegistry;
use crate::trend::TrendSummarizer;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub registry: Arc<EntityRegistry>,
    pub classifier: Arc<Classifier>,
    pub surveillance: Arc<SurveillanceManager>,
    pub query: Arc<QueryEngine>,
    pub trend: Arc<TrendSummarizer>,
    pub scheduler: Arc<Scheduler>,
    pub retention: Arc<Vec<RetentionPolicy>>,
}

/// Web server for PulseWatch.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // Ingest
        .route("/api/samples", post(handlers::handle_ingest))
        .route("/api/entities", put(handlers::handle_register_entity))
        // Queries
        .route("/api/collections/{collection}", get(handlers::handle_collection))
        .route("/api/summary", get(handlers::handle_summary))
        .route("/api/entities/{key}", get(handlers::handle_entity))
        .route("/api/entities/{key}/spark", get(handlers::handle_spark))
        .route("/api/entities/{key}/rollups", get(handlers::handle_rollups))
        // Surveillance
        .route("/api/surveillance", get(handlers::handle_watch_list))
        .route("/api/surveillance/history", get(handlers::handle_watch_history))
        .route("/api/surveillance/{key}", post(handlers::handle_watch_add))
        .route("/api/surveillance/{key}/remove", post(handlers::handle_watch_remove))
        .route("/api/surveillance/{key}/fix", post(handlers::handle_watch_fix))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024)) // 4MB, sample batches
        .with_state(state)
}
