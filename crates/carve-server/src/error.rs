use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use carve_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::NotFound(_) | AppError::ConfigNotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::InvalidSelector { .. }
            | AppError::ProposalError(_)
            | AppError::ParseError(_)
            | AppError::InvalidUrl(_)
            | AppError::SerializationError(_)
            | AppError::SampleError(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::HttpError(_)
            | AppError::HttpStatus { .. }
            | AppError::NetworkError(_)
            | AppError::LlmError { .. }
            | AppError::ContextWindowExceeded(_) => StatusCode::BAD_GATEWAY,
            AppError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DatabaseError(_) | AppError::ConfigError(_) | AppError::Generic(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_and_bad_input_are_client_errors() {
        let cases = [
            (AppError::NotFound("run".into()), StatusCode::NOT_FOUND),
            (AppError::ConfigNotFound("https://a.test/x".into()), StatusCode::NOT_FOUND),
            (
                AppError::InvalidSelector {
                    selector: "div[[".into(),
                    message: "bad".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (AppError::SampleError("no domain".into()), StatusCode::BAD_REQUEST),
            (AppError::AlreadyExists("run".into()), StatusCode::CONFLICT),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn upstream_failures_are_gateway_errors() {
        assert_eq!(
            ApiError(AppError::LlmError {
                message: "boom".into(),
                status_code: 500,
                retryable: true,
            })
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError(AppError::DatabaseError("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
