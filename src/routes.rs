use crate::auth::{require_jwt, JwtValidator};
use crate::handlers::{identity, liveness, readiness, AppState};
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, TraceLayer},
};

pub fn create_router(state: AppState, debug: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        // Health checks
        .route("/healthz/liveness", get(liveness))
        .route("/healthz/readiness", get(readiness))
        .merge(api_router(state.auth.clone()))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(debug)),
        )
        .with_state(state)
}

/// Routes behind the JWT middleware
pub fn api_router<S>(auth: Arc<JwtValidator>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/v1/identity", get(identity))
        .route_layer(middleware::from_fn_with_state(auth, require_jwt))
}
