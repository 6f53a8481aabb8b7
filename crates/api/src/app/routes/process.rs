use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::error;

use taskbridge_infra::BridgeOutcome;
use taskbridge_infra::jobs::PROCESS_TASK;

use crate::app::dto::{ProcessRequest, ProcessResponse};
use crate::app::errors;
use crate::app::services::AppServices;

/// `POST /process`: run the delay-echo job and wait for it, up to the
/// configured task timeout.
pub async fn process(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };

    let params = match request.validate() {
        Ok(p) => p,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    match services.bridge.submit_and_wait(PROCESS_TASK, &params).await {
        Ok(outcome) => outcome_to_response(outcome),
        Err(e) => {
            error!(job_id = ?e.job_id(), error = %e, "process request failed");
            errors::bridge_error_to_response(&e)
        }
    }
}

fn outcome_to_response(outcome: BridgeOutcome) -> axum::response::Response {
    match outcome {
        BridgeOutcome::Completed { value, elapsed, .. } => (
            StatusCode::OK,
            Json(ProcessResponse::Completed {
                result: value,
                time: elapsed.as_secs_f64(),
            }),
        )
            .into_response(),
        BridgeOutcome::Pending {
            message, elapsed, ..
        } => (
            StatusCode::ACCEPTED,
            Json(ProcessResponse::Pending {
                message,
                time: elapsed.as_secs_f64(),
            }),
        )
            .into_response(),
        BridgeOutcome::Failed { job_id, error, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ProcessResponse::Failed { error, job_id }),
        )
            .into_response(),
    }
}
