//! `If-Match` optimistic-concurrency check.
//!
//! Provided for embedding callers that own versioned resources; no gateway route
//! uses it. Independent of the idempotency coordinator; the two may be stacked on
//! the same route but share no state.

use axum::{
    http::{header::IF_MATCH, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("resource not found")]
    NotFound,
    #[error("If-Match header required")]
    MissingIfMatch,
    #[error("resource version does not match If-Match")]
    VersionMismatch,
}

impl PreconditionError {
    pub fn api_error(self) -> ApiError {
        match self {
            PreconditionError::NotFound => ApiError::new(StatusCode::NOT_FOUND, "Not found"),
            PreconditionError::MissingIfMatch => {
                ApiError::new(StatusCode::BAD_REQUEST, "If-Match header required")
            }
            PreconditionError::VersionMismatch => {
                ApiError::new(StatusCode::PRECONDITION_FAILED, "Precondition failed")
            }
        }
    }
}

impl IntoResponse for PreconditionError {
    fn into_response(self) -> Response {
        self.api_error().into_response()
    }
}

/// Compare the request's `If-Match` against the resource's current version.
///
/// `current_version` is `None` when the resource does not exist. Entity tags may be
/// quoted or weak (`W/"3"`), and several may be listed; `*` matches any existing resource.
pub fn check_if_match(
    headers: &HeaderMap,
    current_version: Option<&str>,
) -> Result<(), PreconditionError> {
    let current = current_version.ok_or(PreconditionError::NotFound)?;

    let raw = headers
        .get(IF_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(PreconditionError::MissingIfMatch)?;

    let matched = raw
        .split(',')
        .map(normalize_tag)
        .any(|tag| tag == "*" || tag == current);

    if matched {
        Ok(())
    } else {
        Err(PreconditionError::VersionMismatch)
    }
}

fn normalize_tag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn if_match(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(IF_MATCH, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test_timeout::timeout]
    fn matching_versions_pass() {
        assert_eq!(check_if_match(&if_match("3"), Some("3")), Ok(()));
        assert_eq!(check_if_match(&if_match("\"3\""), Some("3")), Ok(()));
        assert_eq!(check_if_match(&if_match("W/\"3\""), Some("3")), Ok(()));
        assert_eq!(check_if_match(&if_match("\"1\", \"3\""), Some("3")), Ok(()));
        assert_eq!(check_if_match(&if_match("*"), Some("9")), Ok(()));
    }

    #[test_timeout::timeout]
    fn mismatch_is_precondition_failed() {
        let err = check_if_match(&if_match("\"2\""), Some("3")).unwrap_err();
        assert_eq!(err, PreconditionError::VersionMismatch);
        assert_eq!(err.api_error().status(), StatusCode::PRECONDITION_FAILED);
    }

    #[test_timeout::timeout]
    fn missing_header_is_bad_request() {
        let err = check_if_match(&HeaderMap::new(), Some("3")).unwrap_err();
        assert_eq!(err, PreconditionError::MissingIfMatch);
        assert_eq!(err.api_error().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            check_if_match(&if_match("  "), Some("3")),
            Err(PreconditionError::MissingIfMatch)
        );
    }

    #[test_timeout::timeout]
    fn absent_resource_is_not_found_even_without_header() {
        assert_eq!(
            check_if_match(&HeaderMap::new(), None),
            Err(PreconditionError::NotFound)
        );
        assert_eq!(
            check_if_match(&if_match("*"), None),
            Err(PreconditionError::NotFound)
        );
        assert_eq!(
            PreconditionError::NotFound.api_error().status(),
            StatusCode::NOT_FOUND
        );
    }
}
