//! HTTP API for quotes, swaps, sends and wallet history
//!
//! Served together with `/metrics` on the listener configured under
//! `[server]`.

use crate::assets::Network;
use crate::chain::SentTransaction;
use crate::config::ServerConfig;
use crate::coordination::ActionDispatcher;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics;
use crate::state::{HistoryItem, SwapRecord, WalletStore};
use crate::swaps::{Quote, QuoteRequest};
use crate::tx::{SendRequest, TransactionOrchestrator};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ActionDispatcher>,
    pub orchestrator: Arc<TransactionOrchestrator>,
    pub store: Arc<dyn WalletStore>,
}

/// Wallet routes bound to `state`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/quotes", post(get_quotes))
        .route("/swaps", post(start_swap))
        .route("/transactions", post(send_transaction))
        .route("/wallets/:wallet_id/history", get(get_history))
        .with_state(state)
}

/// Run the HTTP server with the routes enabled in `config`
pub async fn run_server(config: ServerConfig, state: AppState) -> OrchestratorResult<()> {
    let mut app = Router::new().route("/health", get(health_check));
    if config.api {
        app = app.merge(router(state));
    }
    if config.metrics {
        app = app.merge(metrics::router());
    }

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Quotes from every provider supporting the pair; failing providers are left out
async fn get_quotes(State(state): State<AppState>, Json(request): Json<QuoteRequest>) -> Json<Vec<Quote>> {
    Json(state.dispatcher.get_quotes(&request).await)
}

async fn start_swap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> Result<Json<SwapRecord>, OrchestratorError> {
    let swap = state
        .dispatcher
        .start_swap(request.network, &request.wallet_id, &request.quote)
        .await?;
    Ok(Json(swap))
}

async fn send_transaction(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SentTransaction>, OrchestratorError> {
    let sent = state.orchestrator.send(request).await?;
    Ok(Json(sent))
}

async fn get_history(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryItem>>, OrchestratorError> {
    let history = state.store.history(query.network, &wallet_id).await?;
    Ok(Json(history))
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::AccountNotFound { .. }
            | OrchestratorError::HistoryItemNotFound { .. }
            | OrchestratorError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::UnknownAsset(_)
            | OrchestratorError::Amount(_)
            | OrchestratorError::Unsupported(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            OrchestratorError::MnemonicUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::ChainConnection { .. }
            | OrchestratorError::Bridge(_)
            | OrchestratorError::BridgeDisconnected(_)
            | OrchestratorError::Timeout { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

// Request types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest {
    network: Network,
    wallet_id: String,
    quote: Quote,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    network: Network,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
