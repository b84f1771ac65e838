use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::metrics::observe;
use crate::models::{Identity, IssuedToken, TokenRecord, TokenStatus};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    pub identity: String,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RenewRequest {
    pub ttl_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub identity: String,
    pub value: String,
}

/// Returned once, at issuance. The only response that carries the value.
#[derive(Serialize)]
pub struct IssueResponse {
    pub identity: Identity,
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<IssuedToken> for IssueResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            value: issued.value.expose().to_string(),
            identity: issued.record.identity,
            issued_at: issued.record.issued_at,
            expires_at: issued.record.expires_at,
        }
    }
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /api/v1/tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TokenStatus>>, AppError> {
    observe("list", async {
        let tokens = state.service.list().await?;
        Ok::<_, AppError>(Json(tokens))
    })
    .await
}

/// POST /api/v1/tokens
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IssueResponse>), AppError> {
    observe("issue", async {
        let Json(payload) = payload?;
        let identity = Identity::parse(payload.identity)?;
        let issued = state
            .service
            .issue(identity, payload.ttl_secs.map(Duration::from_secs))
            .await?;
        Ok::<_, AppError>((StatusCode::CREATED, Json(issued.into())))
    })
    .await
}

/// POST /api/v1/tokens/validate
///
/// A malformed identity is answered with `valid: false`, same as any other miss.
pub async fn validate_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Json<ValidateResponse>, AppError> {
    observe("validate", async {
        let Json(payload) = payload?;
        let valid = match Identity::parse(payload.identity) {
            Ok(identity) => state.service.validate(&identity, &payload.value).await?,
            Err(_) => false,
        };
        Ok::<_, AppError>(Json(ValidateResponse { valid }))
    })
    .await
}

/// GET /api/v1/tokens/:identity
pub async fn token_status(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Result<Json<TokenStatus>, AppError> {
    observe("status", async {
        let identity = Identity::parse(identity)?;
        Ok::<_, AppError>(Json(state.service.status(&identity).await?))
    })
    .await
}

/// DELETE /api/v1/tokens/:identity
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Result<Json<TokenStatus>, AppError> {
    observe("revoke", async {
        let identity = Identity::parse(identity)?;
        let record = state.service.revoke(identity).await?;
        Ok::<_, AppError>(Json(status_of(&state, &record)))
    })
    .await
}

/// POST /api/v1/tokens/:identity/renew
///
/// The body is optional; an empty one renews with the default TTL.
pub async fn renew_token(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    payload: Option<Json<RenewRequest>>,
) -> Result<Json<TokenStatus>, AppError> {
    observe("renew", async {
        let identity = Identity::parse(identity)?;
        let ttl = payload.and_then(|Json(p)| p.ttl_secs).map(Duration::from_secs);
        let record = state.service.renew(identity, ttl).await?;
        Ok::<_, AppError>(Json(status_of(&state, &record)))
    })
    .await
}

// ── Service endpoints (no auth) ──────────────────────────────

/// GET /
pub async fn service_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "service": "tokend",
        "version": env!("CARGO_PKG_VERSION"),
        "instance": state.config.instance,
        "status": "running",
    }))
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET /readyz
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.service.store().check_health().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

/// GET /metrics
pub async fn metrics() -> String {
    crate::metrics::encode_metrics()
}

fn status_of(state: &AppState, record: &TokenRecord) -> TokenStatus {
    TokenStatus::from_record(record, Utc::now(), state.service.renewal_margin())
}
