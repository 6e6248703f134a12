// =============================================================================
// MIDDLEWARE MODULE
// =============================================================================
// Request-wide concerns applied around every route:
//
// - `correlation_id`: read or mint X-Correlation-ID, store it in the request
//   extensions, run the request inside a span carrying it, echo it back
// - `track_metrics`: record count and latency per matched route
// =============================================================================

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::auth::{CorrelationId, CORRELATION_ID_HEADER};
use crate::metrics;

pub async fn correlation_id(mut req: Request, next: Next) -> Response {
    let correlation_id = CorrelationId::from_header(req.headers().get(CORRELATION_ID_HEADER));
    req.extensions_mut().insert(correlation_id);

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %req.method(),
        uri = %req.uri(),
    );

    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

pub async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    // Route template, so /packages/:id is one series rather than one per id.
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let response = next.run(req).await;

    metrics::record_http_request(
        &method,
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}
