//! HTTP handlers for the remote build endpoint.
//!
//! A request is checked against this instance's checkout, then built
//! locally exactly the way a test process would build it.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use scenariodb_core::remote::{BUILD_PATH, ErrorResponse, PROTOCOL_VERSION, RemoteBuildRequest, SCHEMA_PATH};
use scenariodb_core::{BuildServices, DatabaseBuilder, PurgeGate, ResolvedSettings, ScenarioHasher, StalePurger};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::locks::BuildLocks;

/// Shared state of the remote build server.
#[derive(Debug, Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    locks: BuildLocks,
    purger: StalePurger,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self { config: Arc::new(config), locks: BuildLocks::new(), purger: StalePurger::new(PurgeGate::new()) }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(BUILD_PATH, post(build))
        .route(SCHEMA_PATH, get(schema))
        .with_state(state)
}

async fn build(
    State(state): State<AppState>, Json(request): Json<RemoteBuildRequest>,
) -> Result<Json<ResolvedSettings>, ApiError> {
    let start = Instant::now();
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(ApiError::VersionMismatch { expected: PROTOCOL_VERSION, got: request.protocol_version });
    }
    request.config.validate().map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let hasher = ScenarioHasher::with_root(&state.config.project_root);
    let ours = hasher.compute_hashes(&request.config)?;
    if ours.build_hash != request.build_hash {
        return Err(ApiError::BuildHashMismatch { expected: ours.build_hash, got: request.build_hash });
    }

    let config = state.config.localize(request.config);
    let services = BuildServices::from_config(&config)?;
    let mut builder = DatabaseBuilder::new(config, services).with_test_name(&request.test_name);
    let scenario_hash = builder.hash()?.scenario_hash.clone();

    let _guard = state.locks.acquire(&builder.config().connection, &scenario_hash).await;
    state.purger.purge_once(std::slice::from_ref(&builder)).await;

    let settings = builder.execute().await?.clone();
    tracing::info!(
        "Built \"{}\" for connection \"{}\" of {} ({}ms)",
        settings.database,
        settings.connection,
        if request.test_name.is_empty() { "an unnamed test" } else { request.test_name.as_str() },
        start.elapsed().as_millis()
    );
    Ok(Json(settings))
}

/// JSON schemas of the request, response and error bodies.
async fn schema() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "protocol_version": PROTOCOL_VERSION,
        "request": schemars::schema_for!(RemoteBuildRequest),
        "response": schemars::schema_for!(ResolvedSettings),
        "error": schemars::schema_for!(ErrorResponse),
    }))
}
