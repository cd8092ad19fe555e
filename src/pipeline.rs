use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{ApiError, DebugErrorBody, FieldError};
use crate::state::AppState;

/// Statuses the random-error middleware draws from.
const INJECTED_STATUSES: [u16; 17] = [
    403, 406, 408, 418, 422, 429, 451, 500, 501, 502, 503, 504, 505, 506, 507, 508, 510,
];

/// Query flag that bypasses fault injection for a single request.
const NO_INJECT_FLAG: &str = "noInjectErrors";

/// Mandatory first stage: assigns the request id, span and cancel handle,
/// tracks the request in the in-flight registry, and turns sweeper/shutdown
/// cancellation into a 408.
pub async fn request_init(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let reqid = Uuid::new_v4();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let ip = client_ip(&state, &req);

    let span = tracing::info_span!("request", %reqid, %method, path = %path, ip = %ip);
    let started = Instant::now();
    let cancel = state.inflight.register(reqid);
    state.metrics.http_inflight.inc();

    let mut response = tokio::select! {
        response = next.run(req).instrument(span.clone()) => response,
        _ = cancel.cancelled() => ApiError::RequestTimeout.into_response(),
    };
    set_json_charset(&mut response);

    state.inflight.complete(&reqid);
    state.metrics.http_inflight.dec();
    let status = response.status();
    state.metrics.record_request(&method, status, started.elapsed());
    span.in_scope(|| {
        tracing::info!(
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request complete"
        );
    });
    response
}

/// Stateless variant for routers that skip the full pipeline.
pub async fn json_charset(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    set_json_charset(&mut response);
    response
}

fn set_json_charset(response: &mut Response) {
    use axum::http::header::CONTENT_TYPE;
    use axum::http::HeaderValue;

    let is_bare_json = response
        .headers()
        .get(CONTENT_TYPE)
        .is_some_and(|value| value.as_bytes() == b"application/json");
    if is_bare_json {
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
    }
}

fn client_ip(state: &AppState, req: &Request) -> String {
    if state.config.trust_proxy {
        if let Some(forwarded) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
        {
            return forwarded.trim().to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Uniform extra latency: `base + jitter * U(0,1)`; active only when either
/// knob is non-zero.
pub async fn inject_latency(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let base = state.config.extra_latency_base;
    let jitter = state.config.extra_latency_jitter;
    if !base.is_zero() || !jitter.is_zero() {
        tokio::time::sleep(injection_delay(base, jitter)).await;
    }
    next.run(req).await
}

pub async fn inject_random_errors(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let rate = state.config.extra_random_error_rate;
    if rate <= 0.0
        || req.uri().path() == "/health"
        || has_no_inject_flag(req.uri().query())
        || rand::thread_rng().gen::<f64>() >= rate
    {
        return next.run(req).await;
    }

    tokio::time::sleep(injection_delay(
        state.config.extra_random_error_base,
        state.config.extra_random_error_jitter,
    ))
    .await;

    state.metrics.injected_errors.inc();
    let drawn = INJECTED_STATUSES[rand::thread_rng().gen_range(0..INJECTED_STATUSES.len())];
    let status = StatusCode::from_u16(drawn).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    ApiError::Injected { status }.into_response()
}

fn injection_delay(base: Duration, jitter: Duration) -> Duration {
    base + jitter.mul_f64(rand::thread_rng().gen::<f64>())
}

fn has_no_inject_flag(query: Option<&str>) -> bool {
    query
        .map(|query| {
            query.split('&').any(|pair| {
                pair == NO_INJECT_FLAG || pair.starts_with(&format!("{NO_INJECT_FLAG}="))
            })
        })
        .unwrap_or(false)
}

/// Mandatory last stage (outermost layer): swaps the production error body
/// for the debug rendering when `API_HTTP_DEBUG_ERRORS` is set.
pub async fn render_debug_errors(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;
    if !state.config.debug_errors {
        return response;
    }
    let Some(DebugErrorBody(body)) = response.extensions().get::<DebugErrorBody>().cloned() else {
        return response;
    };

    let mut rendered = Json(body).into_response();
    *rendered.status_mut() = response.status();
    for (name, value) in response.headers() {
        let replaced_by_rerender = name == axum::http::header::CONTENT_TYPE
            || name == axum::http::header::CONTENT_LENGTH
            || name == axum::http::header::CONTENT_ENCODING;
        if !replaced_by_rerender {
            rendered.headers_mut().insert(name.clone(), value.clone());
        }
    }
    rendered
}

/// CORS layer from the configured regex whitelist; `None` disables the stage
/// entirely.
pub fn cors_layer(whitelist: &[Regex]) -> Option<CorsLayer> {
    if whitelist.is_empty() {
        return None;
    }
    let patterns: Vec<Regex> = whitelist.to_vec();
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(move |origin, _| {
                origin
                    .to_str()
                    .map(|origin| patterns.iter().any(|pattern| pattern.is_match(origin)))
                    .unwrap_or(false)
            }))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// JSON extractor that renders rejections through the error taxonomy: an
/// over-limit body is a 413, everything else a 400 with an `errors` array.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

/// Query extractor with the same rejection treatment: malformed or
/// unrecognized parameters become a 400 with an `errors` array.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::validation(vec![FieldError {
                field: "query".to_string(),
                message: rejection.body_text(),
            }])),
        }
    }
}

fn map_json_rejection(rejection: JsonRejection) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge;
    }
    ApiError::validation(vec![FieldError {
        field: "body".to_string(),
        message: rejection.body_text(),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_status_list_matches_the_contract() {
        assert_eq!(INJECTED_STATUSES.len(), 17);
        for code in INJECTED_STATUSES {
            assert!(StatusCode::from_u16(code).is_ok());
        }
    }

    #[test]
    fn no_inject_flag_detection() {
        assert!(has_no_inject_flag(Some("noInjectErrors")));
        assert!(has_no_inject_flag(Some("noInjectErrors=1")));
        assert!(has_no_inject_flag(Some("signature=0xab&noInjectErrors")));
        assert!(!has_no_inject_flag(Some("signature=0xab")));
        assert!(!has_no_inject_flag(Some("noInjectErrorsX=1")));
        assert!(!has_no_inject_flag(None));
    }

    #[test]
    fn injection_delay_is_bounded_by_base_plus_jitter() {
        let base = Duration::from_millis(20);
        let jitter = Duration::from_millis(10);
        for _ in 0..50 {
            let delay = injection_delay(base, jitter);
            assert!(delay >= base);
            assert!(delay <= base + jitter);
        }
    }

    #[test]
    fn cors_layer_only_exists_with_a_whitelist() {
        assert!(cors_layer(&[]).is_none());
        let whitelist = vec![Regex::new(r"^https://app\.example\.com$").unwrap()];
        assert!(cors_layer(&whitelist).is_some());
    }
}
