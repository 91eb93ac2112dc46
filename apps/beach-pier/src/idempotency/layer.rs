use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::error;

use super::coordinator::{Acceptance, IdempotencyCoordinator, Rejection};
use crate::error::ApiError;

pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

const MISSING_KEY: ApiError = ApiError::new(
    StatusCode::BAD_REQUEST,
    "X-Idempotency-Key header required",
);
const DUPLICATE_REQUEST: ApiError = ApiError::new(StatusCode::CONFLICT, "Duplicate request");
const STORE_UNAVAILABLE: ApiError = ApiError::new(
    StatusCode::SERVICE_UNAVAILABLE,
    "Idempotency store unavailable",
);

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::MissingKey => MISSING_KEY,
            Rejection::DuplicateKey => DUPLICATE_REQUEST,
        }
    }
}

/// Middleware admitting a request only if its `X-Idempotency-Key` has not been seen.
///
/// Mount with `axum::middleware::from_fn_with_state(coordinator, require_idempotency_key)`.
/// Store failures reject the request; the inner service is never reached without an acceptance.
pub async fn require_idempotency_key(
    State(coordinator): State<IdempotencyCoordinator>,
    request: Request,
    next: Next,
) -> Response {
    // Non-UTF-8 header values are treated as absent.
    let key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match coordinator.try_accept(key.as_deref()).await {
        Ok(Acceptance::Accepted(_)) => next.run(request).await,
        Ok(Acceptance::Rejected(rejection)) => ApiError::from(rejection).into_response(),
        Err(err) => {
            error!(error = %err, "rejecting request: idempotency store unavailable");
            STORE_UNAVAILABLE.into_response()
        }
    }
}
