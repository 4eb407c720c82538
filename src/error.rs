use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid test configuration: {0}")]
    Validation(String),

    #[error("Test {test_id} is already running for user {user_id}")]
    DuplicateTest { user_id: String, test_id: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Test not found: {0}")]
    TestNotFound(String),

    #[error("Job {job_id} is {status}: {reason}")]
    InvalidJobState {
        job_id: String,
        status: String,
        reason: String,
    },

    #[error("Orchestration failure: {0}")]
    Orchestration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::Storage(e.to_string())
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::DuplicateTest { .. } => StatusCode::CONFLICT,
            OrchestratorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::TestNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidJobState { .. } => StatusCode::CONFLICT,
            OrchestratorError::Orchestration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
