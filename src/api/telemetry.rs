//! Request metrics and spans for the REST surface.

use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info_span, Instrument};

struct HttpInstruments {
    request_count: Counter<u64>,
    request_duration_seconds: Histogram<f64>,
    request_errors: Counter<u64>,
    active_requests: UpDownCounter<i64>,
}

fn http_instruments() -> &'static HttpInstruments {
    static INSTRUMENTS: OnceLock<HttpInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("searchfabric.api.http");
        HttpInstruments {
            request_count: meter
                .u64_counter("http.server.request.count")
                .with_description("Total number of HTTP requests handled by the search API")
                .init(),
            request_duration_seconds: meter
                .f64_histogram("http.server.request.duration")
                .with_description("Time until response headers are sent")
                .with_unit("s")
                .init(),
            request_errors: meter
                .u64_counter("http.server.request.errors")
                .with_description("HTTP requests with 4xx/5xx status codes")
                .init(),
            active_requests: meter
                .i64_up_down_counter("http.server.active_requests")
                .with_description("Requests being processed")
                .init(),
        }
    })
}

fn http_attributes(method: &str, route: &str, status: u16) -> Vec<KeyValue> {
    vec![
        KeyValue::new("http.request.method", method.to_string()),
        KeyValue::new("http.route", route.to_string()),
        KeyValue::new("http.response.status_code", status as i64),
    ]
}

/// Records request count, duration and status-class errors.
///
/// Streaming responses are measured up to the moment the headers are
/// ready; the body keeps flowing after that.
pub async fn http_observability_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let span = info_span!(
        "http.request",
        otel.kind = "server",
        http.request.method = %method,
        http.route = %route
    );
    let instruments = http_instruments();
    let route_attr = [KeyValue::new("http.route", route.clone())];
    instruments.active_requests.add(1, &route_attr);
    let response = next.run(req).instrument(span).await;
    instruments.active_requests.add(-1, &route_attr);

    let status = response.status().as_u16();
    let elapsed = start.elapsed().as_secs_f64();
    let attrs = http_attributes(&method, &route, status);

    instruments.request_count.add(1, &attrs);
    instruments.request_duration_seconds.record(elapsed, &attrs);
    if status >= 400 {
        instruments.request_errors.add(1, &attrs);
    }
    debug!(method = %method, route = %route, status, elapsed, "request handled");

    response
}
