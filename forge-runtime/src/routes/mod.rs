//! HTTP Routes Module
//!
//! Route handlers organized by surface: entity CRUD, actions, views,
//! auth, webhooks, health and dev introspection. The router is
//! assembled from the pieces here; auth routes mount only under the
//! password provider, dev routes only in development (production falls
//! through to the 404 fallback, never 403, so the paths disclose
//! nothing).

pub mod actions;
pub mod auth;
pub mod dev;
pub mod entities;
pub mod health;
pub mod view_read;
pub mod webhooks;

use crate::error::ApiError;
use crate::pipeline;
use crate::state::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the complete router for a server state.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/actions/:name", post(actions::execute))
        .route("/views/:name", get(view_read::read))
        .route(
            "/entities/:entity",
            get(entities::list).post(entities::create),
        )
        .route(
            "/entities/:entity/:id",
            get(entities::fetch)
                .put(entities::update)
                .delete(entities::remove),
        );

    let mut router = Router::new()
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/ws", get(crate::ws::ws_handler))
        .nest("/api", api)
        .route("/webhooks/:name", post(webhooks::receive));

    if state.auth.password_flow_enabled() {
        router = router.nest("/auth", auth::create_router());
    }
    if state.config.env.is_development() {
        router = router.nest("/_dev", dev::create_router());
    }

    router
        .fallback(|| async { ApiError::not_found() })
        .layer(middleware::from_fn(pipeline::trace_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::deadline_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
