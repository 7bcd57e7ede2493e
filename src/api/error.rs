//! Mapping of core errors onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::error::{ConfigError, DatabaseError, DispatchError, Error, SurveyError};

/// A core error on its way out as `{"error": "..."}`.
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl ApiError {
    /// A 400 for malformed input that never reached the core.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(Error::Config(ConfigError::ParseError(message.into())))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Channel(_) | Error::Llm(_) => StatusCode::BAD_GATEWAY,
            Error::Dispatch(e) => match e {
                DispatchError::RunNotFound { .. } | DispatchError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
                DispatchError::EmptyRecipients | DispatchError::EmptyTemplate => StatusCode::BAD_REQUEST,
                DispatchError::NoOrderSource => StatusCode::SERVICE_UNAVAILABLE,
            },
            Error::Survey(e) => match e {
                SurveyError::NotFound { .. } => StatusCode::NOT_FOUND,
                SurveyError::AlreadyExists { .. } | SurveyError::InvalidTransition { .. } => StatusCode::CONFLICT,
                SurveyError::NotDispatchable { .. } | SurveyError::Blacklisted { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, %status, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn statuses() {
        let cases = [
            (
                ApiError::from(DispatchError::RunNotFound { id: Uuid::nil() }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(SurveyError::Blacklisted { phone: "1".into() }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(DatabaseError::Query("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::bad_request("nope"), StatusCode::BAD_REQUEST),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected);
        }
    }
}
