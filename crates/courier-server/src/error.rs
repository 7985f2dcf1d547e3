use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::CourierError;
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CourierError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Connection hub is not running")]
    HubUnavailable,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Protocol(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Store(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable".to_string())
            }
            ServerError::HubUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
