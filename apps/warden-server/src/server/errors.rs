use axum::{http::StatusCode, response::IntoResponse, Json};

use super::{
    metrics::{record_auth_failure, record_rate_limit_hit},
    types::ErrorBody,
};

/// Everything a handler can reject with. Token failures collapse to one
/// generic response body so callers cannot distinguish which check failed;
/// the variant is still kept distinct internally for metrics and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceFailure {
    InvalidRequest,
    Unauthenticated,
    InvalidToken,
    Expired,
    Revoked,
    WrongTokenType,
    AlreadyUsed,
    Forbidden,
    UnknownQuery,
    RateLimited,
    PayloadTooLarge,
    Internal,
}

impl ServiceFailure {
    pub(crate) fn reason(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidToken => "invalid_token",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::WrongTokenType => "wrong_token_type",
            Self::AlreadyUsed => "already_used",
            Self::Forbidden => "forbidden",
            Self::UnknownQuery => "unknown_query",
            Self::RateLimited => "rate_limited",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Internal => "internal",
        }
    }

    fn is_token_rejection(self) -> bool {
        matches!(
            self,
            Self::Unauthenticated
                | Self::InvalidToken
                | Self::Expired
                | Self::Revoked
                | Self::WrongTokenType
                | Self::AlreadyUsed
        )
    }
}

impl std::fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Forbidden => record_auth_failure("forbidden"),
            Self::RateLimited => record_rate_limit_hit("http", "over_limit"),
            failure if failure.is_token_rejection() => record_auth_failure(failure.reason()),
            _ => {}
        }

        if self.is_token_rejection() {
            // One body for every token rejection: no oracle on which check
            // failed.
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "invalid_or_expired_token",
                }),
            )
                .into_response();
        }

        match self {
            Self::InvalidRequest => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "invalid_request",
                }),
            )
                .into_response(),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(ErrorBody { error: "forbidden" }),
            )
                .into_response(),
            Self::UnknownQuery => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "unknown_query",
                }),
            )
                .into_response(),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorBody {
                    error: "rate_limited",
                }),
            )
                .into_response(),
            Self::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorBody {
                    error: "payload_too_large",
                }),
            )
                .into_response(),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "internal_error",
                }),
            )
                .into_response(),
        }
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
