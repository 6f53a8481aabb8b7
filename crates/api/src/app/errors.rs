use std::error::Error as _;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use taskbridge_infra::BridgeError;

use crate::app::dto::ProcessResponse;

/// Bridge errors are internal failures from the caller's point of view.
/// The message keeps the source chain so the cause is not lost.
pub fn bridge_error_to_response(err: &BridgeError) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ProcessResponse::Error {
            message: "Internal server error",
            error: error_chain(err),
        }),
    )
        .into_response()
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn error_chain(err: &BridgeError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
