//! PulseWatch - ISP telemetry classification service
//!
//! Ingests ping, optical and usage samples, classifies every subscriber
//! and link over rolling windows, and keeps a watch list of entities with
//! persistent problems.

mod classify;
mod config;
mod db;
mod query;
mod scheduler;
mod surveillance;
mod telemetry;
mod trend;
mod web;

use classify::Classifier;
use config::{PolicyConfig, ServerConfig};
use db::Store;
use query::QueryEngine;
use scheduler::Scheduler;
use surveillance::SurveillanceManager;
use telemetry::{EntityRegistry, Horizon, RollupStore};
use trend::TrendSummarizer;
use web::{AppState, Server};

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pulsewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    let policy = PolicyConfig::load(cfg.policy_path.as_deref())?;
    tracing::info!("Starting PulseWatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    // Rebuild in-memory state
    let registry = Arc::new(EntityRegistry::new());
    let entities = store.get_entities()?;
    tracing::info!("Restored {} entities", entities.len());
    registry.restore(entities);

    let rollups = Arc::new(RollupStore::new(&policy.store));
    let since = Utc::now() - ChronoDuration::seconds(policy.store.retention_secs.max(Horizon::largest().seconds()));
    let stored = store.get_samples_since(since)?;
    let loaded = rollups.restore(stored.into_iter().map(|s| (s.entity, s.sample)));
    tracing::info!("Restored {} samples into rolling windows", loaded);

    let classifier = Arc::new(Classifier::new(
        policy.classifier.clone(),
        rollups.clone(),
        registry.clone(),
    ));
    let surveillance = Arc::new(SurveillanceManager::new(
        policy.surveillance.clone(),
        store.clone(),
        classifier.clone(),
        rollups.clone(),
    ));
    let watched = surveillance.restore()?;
    tracing::info!("Restored {} watch-list entries", watched);

    let trend = Arc::new(TrendSummarizer::new(
        policy.trend.clone(),
        policy.classifier.optical.clone(),
        rollups.clone(),
        registry.clone(),
    ));
    let query = Arc::new(QueryEngine::new(
        registry.clone(),
        rollups.clone(),
        classifier.clone(),
        surveillance.clone(),
        trend.clone(),
    ));

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        rollups,
        surveillance.clone(),
        policy.retention.clone(),
        cfg.eval_interval,
    ));
    scheduler.start().await;

    // Start web server
    let state = AppState {
        store,
        registry,
        classifier,
        surveillance,
        query,
        trend,
        scheduler: scheduler.clone(),
        retention: Arc::new(policy.retention),
    };
    let server = Server::new(cfg, state);
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;

    scheduler.stop().await;
    Ok(())
}
