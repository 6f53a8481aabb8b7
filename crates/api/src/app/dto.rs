use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskbridge_core::JobId;
use taskbridge_infra::jobs::ProcessParams;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub delay: i64,
}

impl ProcessRequest {
    pub fn validate(&self) -> Result<ProcessParams, String> {
        if self.delay < 0 {
            return Err(format!("delay must be >= 0, got {}", self.delay));
        }
        Ok(ProcessParams::new(self.delay))
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessResponse {
    Completed { result: Value, time: f64 },
    Pending { message: String, time: f64 },
    Failed { error: String, job_id: JobId },
    Error { message: &'static str, error: String },
}
