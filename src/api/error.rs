use crate::error::Error;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Wraps a domain error so handlers can return it with `?`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::LockConflict(_) => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::TriggerFailure(_) => StatusCode::BAD_GATEWAY,
            Error::IndexLoad { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;

    #[test]
    fn domain_errors_map_to_status_codes() {
        let cases = [
            (Error::LockConflict("busy".into()), StatusCode::CONFLICT),
            (Error::job_not_found("j1"), StatusCode::NOT_FOUND),
            (Error::TriggerFailure("down".into()), StatusCode::BAD_GATEWAY),
            (
                Error::IndexLoad {
                    file_id: "f1".into(),
                    source: IndexError::MissingArtifact("indexes/f1/index.bin".into()),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (Error::Config("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError(error).status(), expected);
        }
    }
}
