use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use prometheus::{Encoder, Registry, TextEncoder};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::Metrics;

/// Consecutive-failure restart ladder; the last step repeats.
pub const RESTART_BACKOFF: [Duration; 8] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(90),
    Duration::from_secs(120),
];

#[derive(Clone)]
struct SidecarState {
    /// Shared service registry; with in-process workers this is already the
    /// aggregated cluster view.
    service_registry: Registry,
    /// Sidecar-local registry (process metrics), concatenated after the
    /// service families.
    local_registry: Registry,
    compression: bool,
}

/// Spawns the self-supervising metrics exporter. Failures inside never
/// propagate; the exporter restarts itself with backoff until cancelled.
pub fn start(config: Arc<Config>, metrics: Arc<Metrics>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { supervise(config, metrics, cancel).await })
}

async fn supervise(config: Arc<Config>, metrics: Arc<Metrics>, cancel: CancellationToken) {
    let local_registry = Registry::new();
    #[cfg(target_os = "linux")]
    {
        let collector = prometheus::process_collector::ProcessCollector::for_self();
        let _ = local_registry.register(Box::new(collector));
    }

    let state = SidecarState {
        service_registry: metrics.registry.clone(),
        local_registry,
        compression: config.prometheus_compression,
    };
    let addr = config.prometheus_bind_addr();

    let mut attempt: usize = 0;
    while !cancel.is_cancelled() {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                attempt = 0;
                listener
            }
            Err(err) => {
                tracing::warn!(addr = %addr, err = %err, "metrics exporter failed to listen");
                if !backoff_sleep(&mut attempt, &cancel).await {
                    return;
                }
                continue;
            }
        };
        tracing::info!(addr = %addr, "metrics exporter listening");

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state.clone());
        let graceful = cancel.clone();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await });
        match serve.await {
            Ok(()) => return,
            Err(err) => {
                tracing::warn!(err = %err, "metrics exporter failed; restarting");
                if !backoff_sleep(&mut attempt, &cancel).await {
                    return;
                }
            }
        }
    }
}

async fn backoff_sleep(attempt: &mut usize, cancel: &CancellationToken) -> bool {
    let delay = RESTART_BACKOFF[(*attempt).min(RESTART_BACKOFF.len() - 1)];
    *attempt += 1;
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn render_exposition(state: &SidecarState) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    encoder.encode(&state.service_registry.gather(), &mut body)?;
    encoder.encode(&state.local_registry.gather(), &mut body)?;
    Ok(body)
}

async fn metrics_handler(State(state): State<SidecarState>, headers: HeaderMap) -> Response {
    let body = match render_exposition(&state) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(err = %err, "metrics encoding failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response();
        }
    };

    let accepts_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"));
    if state.compression && accepts_gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&body).and_then(|_| encoder.try_finish()).is_ok() {
            return (
                [
                    (header::CONTENT_TYPE, prometheus::TEXT_FORMAT),
                    (header::CONTENT_ENCODING, "gzip"),
                ],
                encoder.finish().unwrap_or_default(),
            )
                .into_response();
        }
    }

    ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(compression: bool) -> SidecarState {
        let metrics = Metrics::new();
        metrics.record_storage("save", true);
        SidecarState {
            service_registry: metrics.registry.clone(),
            local_registry: Registry::new(),
            compression,
        }
    }

    #[test]
    fn backoff_ladder_matches_the_contract() {
        let millis: Vec<u128> = RESTART_BACKOFF.iter().map(|d| d.as_millis()).collect();
        assert_eq!(
            millis,
            vec![500, 1_000, 5_000, 10_000, 30_000, 60_000, 90_000, 120_000]
        );
    }

    #[test]
    fn exposition_carries_service_families() {
        let state = test_state(false);
        let body = render_exposition(&state).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("backups_storage_operations_total"));
    }

    #[tokio::test]
    async fn handler_gzips_when_asked() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let state = test_state(true);
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());

        let response = metrics_handler(State(state), headers).await;
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
        let compressed = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let mut text = String::new();
        GzDecoder::new(&compressed[..])
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("backups_storage_operations_total"));
    }

    #[tokio::test]
    async fn handler_serves_plain_text_by_default() {
        let state = test_state(false);
        let response = metrics_handler(State(state), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn occupied_port_does_not_crash_the_sidecar() {
        let blocker = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(_) => return,
        };
        let port = blocker.local_addr().unwrap().port();

        let tempdir = tempfile::tempdir().unwrap();
        let mut config = crate::test_support::test_config(&tempdir);
        config.prometheus_port = port;

        let cancel = CancellationToken::new();
        let task = start(Arc::new(config), Arc::new(Metrics::new()), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("sidecar stops on cancel")
            .expect("sidecar never panics");
        drop(blocker);
    }
}
