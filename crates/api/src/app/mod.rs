//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: bridge and worker wiring on top of a [`Broker`]
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use taskbridge_infra::{BridgeConfig, Broker};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(broker: &Broker, bridge: BridgeConfig) -> Router {
    let services = Arc::new(AppServices::new(broker, bridge));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
