use axum::{routing::post, Router};

pub mod process;
pub mod system;

pub fn router() -> Router {
    Router::new().route("/process", post(process::process))
}
