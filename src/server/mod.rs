// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use ethers::types::{Address, U256};
use tracing::{info, instrument};

use crate::chain_client::ChainReader;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::syncer::{AccessSyncer, SyncStatus};
use crate::with_metrics;

pub const STATUS_PATH: &str = "/status";
pub const SYNC_PATH: &str = "/sync";
pub const METRICS_PATH: &str = "/metrics";
// Note: Using :param syntax for axum 0.7.x (not {param} which is for axum 0.8.x)
pub const SUBSCRIPTION_PATH: &str = "/season/:season_id/subscriber/:subscriber";
pub const SIGNAL_PUBLIC_PATH: &str = "/signal/:signal_id/public";

pub struct AppState {
    pub syncer: Arc<AccessSyncer>,
    pub chain: Arc<dyn ChainReader>,
    pub metrics: Arc<SyncMetrics>,
    pub registry: prometheus::Registry,
}

pub fn run_server(socket_address: &SocketAddr, state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await.unwrap();
        axum::serve(listener, make_router(state).into_make_service())
            .await
            .unwrap();
    })
}

pub(crate) fn make_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route(STATUS_PATH, get(handle_status))
        .route(SYNC_PATH, post(handle_sync))
        .route(METRICS_PATH, get(handle_metrics))
        .route(SUBSCRIPTION_PATH, get(handle_subscription_check))
        .route(SIGNAL_PUBLIC_PATH, get(handle_signal_public))
        .with_state(state)
}

impl axum::response::IntoResponse for SyncError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            SyncError::ConfigurationMissing(_) | SyncError::Generic(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("Something went wrong: {:?}", self)).into_response()
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    Json(state.syncer.status().await)
}

/// Operator-triggered catch-up; responds with the post-cycle status.
async fn handle_sync(State(state): State<Arc<AppState>>) -> Result<Json<SyncStatus>, SyncError> {
    let metrics = state.metrics.clone();
    let future = async {
        let status = state.syncer.trigger_catch_up_now().await;
        Ok(Json(status))
    };
    with_metrics!(metrics, "trigger_sync", future).await
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<String, SyncError> {
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&state.registry.gather())
        .map_err(|e| SyncError::Generic(format!("failed to encode metrics: {}", e)))
}

#[instrument(level = "error", skip_all, fields(season_id=season_id, subscriber=subscriber))]
async fn handle_subscription_check(
    Path((season_id, subscriber)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<bool>, SyncError> {
    let metrics = state.metrics.clone();
    let future = async {
        let season_id = parse_season_id(&season_id)?;
        let subscriber: Address = subscriber
            .parse()
            .map_err(|_| SyncError::Generic(format!("invalid subscriber address: {}", subscriber)))?;
        let subscribed = state.chain.is_subscribed(season_id, subscriber).await?;
        Ok(Json(subscribed))
    };
    with_metrics!(metrics, "subscription_check", future).await
}

#[instrument(level = "error", skip_all, fields(signal_id=signal_id))]
async fn handle_signal_public(
    Path(signal_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<bool>, SyncError> {
    let metrics = state.metrics.clone();
    let future = async {
        let signal_id = parse_season_id(&signal_id)?;
        // Errors read as "not public" so access is never over-reported
        let public = state
            .chain
            .is_signal_public(signal_id)
            .await
            .unwrap_or(false);
        Ok(Json(public))
    };
    with_metrics!(metrics, "signal_public", future).await
}

fn parse_season_id(raw: &str) -> Result<U256, SyncError> {
    U256::from_dec_str(raw).map_err(|_| SyncError::Generic(format!("invalid id: {}", raw)))
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            info!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    info!("{} request succeeded", $type_);
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            result
        }
    };
}
