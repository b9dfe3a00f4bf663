use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::error::UnlockError;
use crate::verify::{Currency, PaymentClaim, Unlock, Verifier};

#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<Verifier>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any);
    Router::new()
        .route("/unlock", post(unlock))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(bind: &str, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("unlock service listening on {bind}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct UnlockRequest {
    user_wallet: String,
    manga_id: String,
    chapter_id: String,
    signature: String,
    amount: f64,
    currency: String,
}

#[derive(Serialize)]
struct UnlockResponse {
    message: String,
    chapter_id: String,
}

async fn unlock(
    State(state): State<AppState>,
    payload: Result<Json<UnlockRequest>, JsonRejection>,
) -> Result<Json<UnlockResponse>, UnlockError> {
    // Malformed bodies become the same 400 { error } shape as every other
    // validation failure, not axum's default 422.
    let Json(req) = payload.map_err(|rejection| UnlockError::MissingField(rejection.body_text()))?;
    let currency = Currency::from_wire(&req.currency)
        .ok_or_else(|| UnlockError::UnsupportedCurrency(req.currency.clone()))?;

    let claim = PaymentClaim {
        payer_wallet: req.user_wallet,
        manga_id: req.manga_id,
        chapter_id: req.chapter_id.clone(),
        signature: req.signature,
        claimed_amount: Decimal::from_f64(req.amount).unwrap_or_default(),
        currency,
    };
    // Detached from the connection: a client that navigates away mid-request
    // must not cancel verification, since completion only records a true
    // on-chain fact.
    let verifier = state.verifier.clone();
    let outcome = tokio::spawn(async move { verifier.verify_and_unlock(&claim).await })
        .await
        .map_err(|err| UnlockError::Storage(format!("verification task failed: {err}")))??;
    let message = match outcome {
        Unlock::Unlocked => "chapter unlocked",
        Unlock::AlreadyUnlocked => "chapter already unlocked",
    };
    Ok(Json(UnlockResponse { message: message.to_string(), chapter_id: req.chapter_id }))
}
