use crate::auth::{AuthenticatedSubject, JwtValidator};
use crate::database::Database;
use crate::error::AppResult;
use crate::models::{HealthResponse, IdentityResponse};
use axum::{extract::State, Extension, Json};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub auth: Arc<JwtValidator>,
}

fn health(status: &str) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn liveness() -> Json<HealthResponse> {
    health("up")
}

/// 通过存储客户端执行 `SELECT 1;`，不可达时返回 503
pub async fn readiness(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    if let Err(e) = state.db.ping().await {
        warn!(error = %e, "readiness check failed");
        return Err(e.into());
    }
    Ok(health("ready"))
}

pub async fn identity(subject: Option<Extension<AuthenticatedSubject>>) -> Json<IdentityResponse> {
    match subject {
        Some(Extension(subject)) => Json(IdentityResponse {
            authenticated: true,
            subject: subject.subject,
            username: subject.username,
            roles: subject.roles,
        }),
        None => Json(IdentityResponse {
            authenticated: false,
            subject: None,
            username: None,
            roles: Vec::new(),
        }),
    }
}
