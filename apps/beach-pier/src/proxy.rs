use axum::{
    body::{to_bytes, Body},
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
};
use reqwest::Url;
use tracing::{debug, warn};

use crate::{
    error::ApiError,
    idempotency::{require_idempotency_key, IdempotencyCoordinator},
};

/// Largest request body forwarded upstream.
pub const MAX_FORWARD_BODY_BYTES: usize = 8 * 1024 * 1024;

const UPSTREAM_UNAVAILABLE: ApiError =
    ApiError::new(StatusCode::BAD_GATEWAY, "Upstream unavailable");
const BODY_TOO_LARGE: ApiError =
    ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");

/// The business service behind the gateway.
#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base: Url,
}

impl Upstream {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn target(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(query);
        url
    }
}

/// Method router for `/api/*path`: mutating methods are admitted through the
/// idempotency coordinator first, safe methods go straight through.
pub fn api_routes(coordinator: IdempotencyCoordinator) -> MethodRouter<Upstream> {
    let mutating = post(forward)
        .put(forward)
        .patch(forward)
        .delete(forward)
        .layer(from_fn_with_state(coordinator, require_idempotency_key));

    get(forward).options(forward).merge(mutating)
}

async fn forward(
    State(upstream): State<Upstream>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let target = upstream.target(&path, parts.uri.query());

    let body = match to_bytes(body, MAX_FORWARD_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(error = %err, "failed to buffer request body");
            return BODY_TOO_LARGE.into_response();
        }
    };

    debug!(method = %parts.method, %target, "forwarding to upstream");

    let result = upstream
        .client
        .request(parts.method.clone(), target.clone())
        .headers(end_to_end_headers(&parts.headers))
        .body(body)
        .send()
        .await;

    let upstream_response = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(method = %parts.method, %target, error = %err, "upstream request failed");
            return UPSTREAM_UNAVAILABLE.into_response();
        }
    };

    let status = upstream_response.status();
    let headers = end_to_end_headers(upstream_response.headers());
    match upstream_response.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(err) => {
            warn!(%target, error = %err, "failed to read upstream response body");
            UPSTREAM_UNAVAILABLE.into_response()
        }
    }
}

/// Copy of `headers` without hop-by-hop and length headers.
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    const HOP_BY_HOP: [HeaderName; 7] = [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ];

    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || name.as_str() == "keep-alive"
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}
