//! Document conversion gateway
//!
//! Accepts office documents over HTTP and renders them to PDF through
//! external converters chosen by file extension.
//!
//! # Modules
//!
//! - `convert`: routing, work areas and backend invocation
//! - `routes`: HTTP handlers
//! - `config`: environment-driven configuration

pub mod config;
pub mod convert;
pub mod error;
pub mod routes;
pub mod state;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use error::{ConvertError, Result};
pub use state::AppState;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/health", get(routes::health::health_check))
        .merge(routes::convert::router(state.config().limits.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
