//! HTTP surface exposing the resource delegate to the image server.

mod handlers;
mod middleware;
pub mod models;

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
};

use crate::application::ResourceDelegate;

use self::middleware::log_responses;

#[derive(Clone)]
pub struct HttpState {
    pub delegate: Arc<dyn ResourceDelegate>,
}

impl HttpState {
    pub fn new(delegate: Arc<dyn ResourceDelegate>) -> Self {
        Self { delegate }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/delegate/resource-info", post(handlers::resource_info))
        .route("/delegate/pre-authorize", post(handlers::pre_authorize))
        .route("/_health", get(health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
}

async fn health() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
