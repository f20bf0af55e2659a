use poem::{Error as PError, IntoResponse, http::StatusCode};
use poem_openapi::{Object, payload::Json};
use serde::{Deserialize, Serialize};
use service::error::MonitorError;
use tracing::error;

#[derive(Object, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub msg: String,
}

/// Pick the status code from the kind of failure the logic reported.
pub fn status_of(e: &anyhow::Error) -> StatusCode {
    match MonitorError::of(e) {
        Some(MonitorError::Validation(_)) => StatusCode::BAD_REQUEST,
        Some(MonitorError::Conflict(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(MonitorError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(MonitorError::Adapter(_)) => StatusCode::BAD_GATEWAY,
        Some(MonitorError::Storage(_)) | Some(MonitorError::ArchivingFailure(_)) | None => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn anyhow_into_error(e: anyhow::Error) -> PError {
    let status = status_of(&e);
    if status.is_server_error() {
        error!("request failed: {e:#}");
    }
    PError::from_string(format!("{e:#}"), status)
}

pub fn bad_request(msg: impl Into<String>) -> PError {
    PError::from_string(msg.into(), StatusCode::BAD_REQUEST)
}

pub async fn custom_error(e: PError) -> impl IntoResponse {
    let status = e.status();
    Json(ErrorResponse {
        code: status.as_u16(),
        msg: e.to_string(),
    })
    .with_status(status)
}

#[test]
fn test_status_of() {
    let e = anyhow::Error::from(MonitorError::Conflict("dup".into()));
    assert_eq!(status_of(&e), StatusCode::UNPROCESSABLE_ENTITY);
    let e = anyhow::Error::from(MonitorError::Adapter("down".into()));
    assert_eq!(status_of(&e), StatusCode::BAD_GATEWAY);
    assert_eq!(
        status_of(&anyhow::anyhow!("disk full")),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
