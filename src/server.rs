use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ShutdownSignal};
use crate::disposer::Disposer;
use crate::inflight::InflightRegistry;
use crate::metrics::Metrics;
use crate::routes;
use crate::state::AppState;
use crate::storage::BackupStore;

/// Startup fails if the socket has not entered the listening state in time.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Graceful drain bound; afterwards the server escalates to accelerated.
pub const SOFT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
/// Accelerated bound; afterwards the close is abandoned with an error.
pub const HARD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Listening,
    Graceful,
    Accelerated,
    Immediate,
}

/// Shared handle driving the `Listening → Graceful → Accelerated →
/// Terminated` ladder. Transitions are one-way; re-triggering an earlier
/// phase is a no-op.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    graceful: CancellationToken,
    accelerated: CancellationToken,
    immediate: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_graceful(&self) {
        self.graceful.cancel();
    }

    pub fn begin_accelerated(&self) {
        self.graceful.cancel();
        self.accelerated.cancel();
    }

    pub fn begin_immediate(&self) {
        self.graceful.cancel();
        self.accelerated.cancel();
        self.immediate.cancel();
    }

    pub fn phase(&self) -> ShutdownPhase {
        if self.immediate.is_cancelled() {
            ShutdownPhase::Immediate
        } else if self.accelerated.is_cancelled() {
            ShutdownPhase::Accelerated
        } else if self.graceful.is_cancelled() {
            ShutdownPhase::Graceful
        } else {
            ShutdownPhase::Listening
        }
    }
}

fn build_socket(
    addr: SocketAddr,
    config: &Config,
    reuse_port: bool,
) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    if config.server_tcp_nodelay {
        socket.set_nodelay(true)?;
    }
    if config.server_keep_alive {
        socket.set_tcp_keepalive(
            &TcpKeepalive::new().with_time(config.server_keep_alive_timeout),
        )?;
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Resolves the configured address and binds a listening socket within
/// [`LISTEN_TIMEOUT`]. Workers bind with `reuse_port` so the kernel spreads
/// accepts across them.
pub async fn bind_listener(config: &Config, reuse_port: bool) -> Result<TcpListener> {
    let addr_str = config.bind_addr();
    let bind = async {
        let addr = tokio::net::lookup_host(&addr_str)
            .await
            .with_context(|| format!("failed to resolve {addr_str}"))?
            .next()
            .with_context(|| format!("{addr_str} resolved to no addresses"))?;
        match build_socket(addr, config, reuse_port) {
            Ok(listener) => Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                anyhow::bail!(
                    "Failed to bind backups listener on {addr_str}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
                );
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to bind backups listener on {addr_str}"))
            }
        }
    };

    let listener = tokio::time::timeout(LISTEN_TIMEOUT, bind)
        .await
        .map_err(|_| {
            anyhow::anyhow!("listener on {addr_str} did not enter listening state within {LISTEN_TIMEOUT:?}")
        })??;
    TcpListener::from_std(listener).context("failed to register listener with the runtime")
}

/// Periodically aborts requests older than the soft timeout; each aborted
/// request is answered with a 408 by the init middleware.
pub fn spawn_sweeper(
    inflight: Arc<InflightRegistry>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = inflight.sweep(max_age);
                    if swept > 0 {
                        tracing::warn!(swept, "requests exceeded the soft timeout");
                    }
                }
            }
        }
    })
}

fn flatten_serve(
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(inner) => inner.context("server error"),
        Err(join_err) if join_err.is_cancelled() => Ok(()),
        Err(join_err) => Err(join_err).context("server task panicked"),
    }
}

/// Serves the API on `listener` until `shutdown` walks the ladder to
/// completion. Returns once the server has fully closed (or the hard bound
/// expired).
pub async fn run_server(
    state: AppState,
    listener: TcpListener,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let app = if state.config.maintenance_mode {
        routes::maintenance::router()
    } else {
        routes::router(state.clone())
    };

    let mut disposer = Disposer::new();
    let sweeper_cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(
        state.inflight.clone(),
        state.config.req_soft_timeout_interval,
        state.config.req_soft_timeout,
        sweeper_cancel.clone(),
    );
    disposer.push("request sweeper", async move {
        sweeper_cancel.cancel();
        sweeper.await.context("sweeper task panicked")
    });

    let graceful = shutdown.graceful.clone();
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { graceful.cancelled().await });
    let mut serve_task = tokio::spawn(async move { serve.await });

    let result = drive_shutdown(&state, &shutdown, &mut serve_task).await;
    let teardown = disposer.dispose().await;
    result.and(teardown)
}

async fn drive_shutdown(
    state: &AppState,
    shutdown: &ShutdownHandle,
    serve_task: &mut JoinHandle<std::io::Result<()>>,
) -> Result<()> {
    tokio::select! {
        result = &mut *serve_task => return flatten_serve(result),
        _ = shutdown.graceful.cancelled() => {}
    }

    tracing::info!("graceful shutdown: draining in-flight requests");
    tokio::select! {
        result = &mut *serve_task => return flatten_serve(result),
        _ = shutdown.accelerated.cancelled() => {}
        _ = tokio::time::sleep(SOFT_SHUTDOWN_TIMEOUT) => shutdown.begin_accelerated(),
    }

    let aborted = state.inflight.cancel_all();
    tracing::warn!(aborted, "accelerated shutdown: force-closing connections");
    tokio::select! {
        result = &mut *serve_task => flatten_serve(result),
        _ = shutdown.immediate.cancelled() => {
            serve_task.abort();
            tracing::warn!("immediate shutdown: connections dropped");
            Ok(())
        }
        _ = tokio::time::sleep(HARD_SHUTDOWN_TIMEOUT) => {
            serve_task.abort();
            anyhow::bail!("server did not close within the hard shutdown bound")
        }
    }
}

pub(crate) async fn wait_signal(stream: &mut Option<tokio::signal::unix::Signal>) {
    match stream.as_mut() {
        Some(signal) => {
            if signal.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

pub(crate) fn subscribe(
    signals: &[ShutdownSignal],
    wanted: ShutdownSignal,
    kind: tokio::signal::unix::SignalKind,
) -> Result<Option<tokio::signal::unix::Signal>> {
    if !signals.contains(&wanted) {
        return Ok(None);
    }
    tokio::signal::unix::signal(kind)
        .map(Some)
        .context("failed to install signal handler")
}

/// Escalation level for a cumulative shutdown-signal count.
pub fn escalation_phase(count: u32, accelerated_at: u32, immediate_at: u32) -> ShutdownPhase {
    if count >= immediate_at {
        ShutdownPhase::Immediate
    } else if count >= accelerated_at {
        ShutdownPhase::Accelerated
    } else {
        ShutdownPhase::Graceful
    }
}

/// Installs the configured shutdown signals and walks `shutdown` up the
/// ladder as repeated signals arrive.
pub fn spawn_signal_ladder(config: Arc<Config>, shutdown: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::SignalKind;

        let mut term = match subscribe(&config.shutdown_signals, ShutdownSignal::Term, SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(err = format!("{err:#}"), "signal handling unavailable");
                return;
            }
        };
        let mut int = match subscribe(&config.shutdown_signals, ShutdownSignal::Int, SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(err = format!("{err:#}"), "signal handling unavailable");
                return;
            }
        };

        let mut count: u32 = 0;
        loop {
            tokio::select! {
                _ = wait_signal(&mut term) => {}
                _ = wait_signal(&mut int) => {}
            }
            count += 1;
            let phase = escalation_phase(
                count,
                config.shutdown_signal_count_accelerated,
                config.shutdown_signal_count_immediate,
            );
            tracing::info!(count, ?phase, "shutdown signal received");
            match phase {
                ShutdownPhase::Graceful => shutdown.begin_graceful(),
                ShutdownPhase::Accelerated => shutdown.begin_accelerated(),
                ShutdownPhase::Immediate => {
                    shutdown.begin_immediate();
                    break;
                }
                ShutdownPhase::Listening => unreachable!(),
            }
        }
    })
}

/// Single-process mode: one server, signals drive the ladder directly.
pub async fn run_standalone(
    config: Config,
    store: Arc<dyn BackupStore>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let state = AppState::new(config, store, metrics);
    let shutdown = ShutdownHandle::new();
    let listener = bind_listener(&state.config, false).await?;
    tracing::info!(addr = %listener.local_addr()?, "backups API listening");

    let ladder = spawn_signal_ladder(state.config.clone(), shutdown.clone());
    let result = run_server(state, listener, shutdown).await;
    ladder.abort();
    result
}
