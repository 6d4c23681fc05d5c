use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::CoreError;

/// Wraps [`CoreError`] so the REST facade can implement `IntoResponse`
/// without an orphan-rule conflict, translating every error kind to the
/// status code the facade's contract names.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let body = Json(json!({ "Message": self.0.to_string() }));
        (status, body).into_response()
    }
}
