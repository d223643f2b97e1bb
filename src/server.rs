use crate::{
    auth::ProofAuthenticator,
    config::AppConfig,
    database::Database,
    dispatcher::Dispatcher,
    envelope,
    handlers::{self, Market},
    orchestrator::{OrchestratorConfig, PurchaseOrchestrator},
    settlement::{verify_callback_signature, SettlementProvider, SettlementUpdate, SIGNATURE_HEADER},
    wallet::WalletService,
    MarketError,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub orchestrator: Arc<PurchaseOrchestrator>,
    pub webhook_secret: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        orchestrator: Arc<PurchaseOrchestrator>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            dispatcher,
            orchestrator,
            webhook_secret,
            started_at: Utc::now(),
        }
    }
}

/// Wires the orchestrator, handlers and dispatcher from their collaborators.
pub fn build_state(
    db: Database,
    wallet: Arc<dyn WalletService>,
    settlement: Arc<dyn SettlementProvider>,
    config: &AppConfig,
) -> AppState {
    let orchestrator = Arc::new(PurchaseOrchestrator::new(
        db.clone(),
        Arc::clone(&wallet),
        settlement,
        OrchestratorConfig::from(&config.settlement),
    ));

    let market = Market {
        db,
        wallet: Arc::clone(&wallet),
        orchestrator: Arc::clone(&orchestrator),
        default_policy: config.policy.clone(),
    };

    let mut dispatcher = Dispatcher::new(Arc::new(ProofAuthenticator::new(wallet, &config.protocol)));
    handlers::register_all(&mut dispatcher, &market);

    AppState::new(
        Arc::new(dispatcher),
        orchestrator,
        config.settlement.webhook_secret.clone(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/settlement/callback", post(settlement_callback))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Protocol endpoint. Always HTTP 200; failures travel in the envelope.
async fn handle_rpc(State(state): State<AppState>, body: Bytes) -> Json<envelope::Response> {
    let response = match std::str::from_utf8(&body) {
        Ok(text) => state.dispatcher.handle_text(text).await,
        Err(e) => envelope::Response::failure(None, &MarketError::Parse(e.to_string())),
    };
    Json(response)
}

async fn settlement_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    // Unsigned updates are never applied.
    let Some(secret) = state.webhook_secret.as_deref().filter(|s| !s.is_empty()) else {
        tracing::warn!("Rejected settlement callback: no webhook secret configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error", "message": "Settlement callbacks are disabled"})),
        );
    };

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !signature.is_some_and(|signature| verify_callback_signature(secret, &body, signature)) {
        tracing::warn!("Rejected settlement callback with a bad signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "message": "Invalid signature"})),
        );
    }

    let update: SettlementUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": format!("Invalid update: {}", e)})),
            )
        }
    };

    match state.orchestrator.apply_settlement_update(&update).await {
        Ok(Some(status)) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "transactionStatus": status})),
        ),
        Ok(None) => (StatusCode::ACCEPTED, Json(json!({"status": "ignored"}))),
        Err(e) => {
            tracing::error!(settlement_ref = %update.settlement_ref, error = %e, "Failed to apply settlement callback");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": "Internal error"})),
            )
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let methods: Vec<&str> = state.dispatcher.methods().iter().map(|m| m.as_str()).collect();
    Json(json!({
        "requestsServed": state.dispatcher.requests_served(),
        "methods": methods,
        "uptimeSeconds": (Utc::now() - state.started_at).num_seconds(),
    }))
}
