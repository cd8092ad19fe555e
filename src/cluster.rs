use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, ShutdownSignal};
use crate::inflight::InflightRegistry;
use crate::metrics::Metrics;
use crate::server::{self, escalation_phase, ShutdownHandle, ShutdownPhase};
use crate::state::AppState;
use crate::storage::BackupStore;

/// Escalation timers when every worker failed to start.
const STARTUP_FAILURE_ACCELERATE_AFTER: Duration = Duration::from_secs(5);
const STARTUP_FAILURE_IMMEDIATE_AFTER: Duration = Duration::from_secs(10);

/// Per-worker rollover timers during a SIGHUP rolling restart.
const ROLLOVER_ACCELERATE_AFTER: Duration = Duration::from_secs(45);
const ROLLOVER_IMMEDIATE_AFTER: Duration = Duration::from_secs(90);
/// Safety interval that re-evaluates rollover even if no event arrives.
const ROLLOVER_SAFETY_INTERVAL: Duration = Duration::from_millis(17_500);

/// Primary → worker control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryMessage {
    BeginGracefulShutdown,
    BeginForcefulShutdown,
}

/// Worker → primary events. `Ready` is sent once the worker's socket is
/// accepting connections.
#[derive(Debug)]
pub enum WorkerEvent {
    Ready { worker_id: u32 },
    Exited { worker_id: u32, outcome: Result<()> },
}

/// Memory-budgeted pool sizing:
/// `clamp(min, min(max, ⌊(max_mem − primary − reserved) / worker⌋))` with a
/// hard floor of one worker. A zero worker estimate means "no memory
/// constraint".
pub fn pool_size(
    min_workers: usize,
    max_workers: usize,
    mem_primary: u64,
    mem_worker: u64,
    mem_max: u64,
    mem_reserved: u64,
) -> usize {
    if mem_worker == 0 {
        return max_workers.max(1);
    }
    let available = mem_max
        .saturating_sub(mem_primary)
        .saturating_sub(mem_reserved);
    let fit = (available / mem_worker) as usize;
    fit.min(max_workers).max(min_workers).max(1)
}

pub fn desired_workers(config: &Config) -> usize {
    pool_size(
        config.cluster_min_workers,
        config.cluster_max_workers,
        config.cluster_estimated_memory_primary,
        config.cluster_estimated_memory_worker,
        config.cluster_estimated_memory_max,
        config.cluster_memory_reserved,
    )
}

#[derive(Debug, Clone, Copy)]
struct WorkerView {
    id: u32,
    generation: u64,
    listening: bool,
}

/// Picks the worker to roll over: the oldest (lowest id) worker of a prior
/// generation, but only when another worker is listening or the pool is
/// sized to a single worker.
fn select_rollover(workers: &[WorkerView], generation: u64, desired: usize) -> Option<u32> {
    let candidate = workers
        .iter()
        .filter(|worker| worker.generation < generation)
        .min_by_key(|worker| worker.id)?;
    let others_listening = workers
        .iter()
        .any(|worker| worker.id != candidate.id && worker.listening);
    if others_listening || desired == 1 {
        Some(candidate.id)
    } else {
        None
    }
}

struct WorkerHandle {
    id: u32,
    generation: u64,
    listening: bool,
    control: mpsc::UnboundedSender<PrimaryMessage>,
    task: JoinHandle<()>,
}

fn spawn_worker(
    id: u32,
    generation: u64,
    config: Arc<Config>,
    store: Arc<dyn BackupStore>,
    metrics: Arc<Metrics>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        // Workers install no signal handlers; terminal signals reach only
        // the primary, which relays them as control messages.
        let state = AppState {
            config: config.clone(),
            store,
            metrics,
            inflight: Arc::new(InflightRegistry::new()),
        };
        let shutdown = ShutdownHandle::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Some(message) = control_rx.recv().await {
                    match message {
                        PrimaryMessage::BeginGracefulShutdown => shutdown.begin_graceful(),
                        PrimaryMessage::BeginForcefulShutdown => shutdown.begin_accelerated(),
                    }
                }
            });
        }

        let listener = match server::bind_listener(&state.config, true).await {
            Ok(listener) => listener,
            Err(err) => {
                let _ = events.send(WorkerEvent::Exited {
                    worker_id: id,
                    outcome: Err(err),
                });
                return;
            }
        };
        let _ = events.send(WorkerEvent::Ready { worker_id: id });
        let outcome = server::run_server(state, listener, shutdown).await;
        let _ = events.send(WorkerEvent::Exited {
            worker_id: id,
            outcome,
        });
    });

    WorkerHandle {
        id,
        generation,
        listening: false,
        control: control_tx,
        task,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    Stopping,
}

struct RolloverState {
    worker_id: u32,
    accelerate_at: Instant,
    immediate_at: Instant,
    escalated: bool,
}

struct Supervisor {
    config: Arc<Config>,
    store: Arc<dyn BackupStore>,
    metrics: Arc<Metrics>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    workers: HashMap<u32, WorkerHandle>,
    state: PoolState,
    desired: usize,
    generation: u64,
    next_worker_id: u32,
    last_spawn: Option<Instant>,
    any_worker_ready: bool,
    startup_exits: usize,
    startup_failed: bool,
    unclean_exit: bool,
    signal_count: u32,
    last_shutdown_message: Option<PrimaryMessage>,
    rollover: Option<RolloverState>,
    stopping_accelerate_at: Option<Instant>,
    stopping_immediate_at: Option<Instant>,
}

impl Supervisor {
    fn views(&self) -> Vec<WorkerView> {
        self.workers
            .values()
            .map(|worker| WorkerView {
                id: worker.id,
                generation: worker.generation,
                listening: worker.listening,
            })
            .collect()
    }

    fn broadcast(&mut self, message: PrimaryMessage) {
        self.last_shutdown_message = Some(message);
        for worker in self.workers.values() {
            let _ = worker.control.send(message);
        }
    }

    fn maybe_spawn(&mut self) {
        if self.state != PoolState::Running || self.workers.len() >= self.desired {
            return;
        }
        if let Some(last) = self.last_spawn {
            if last.elapsed() <= self.config.cluster_add_worker_debounce {
                return;
            }
        }
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let worker = spawn_worker(
            id,
            self.generation,
            self.config.clone(),
            self.store.clone(),
            self.metrics.clone(),
            self.events_tx.clone(),
        );
        self.workers.insert(id, worker);
        self.last_spawn = Some(Instant::now());
        self.metrics.record_worker_event("spawned");
        tracing::info!(worker_id = id, generation = self.generation, "worker spawned");
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker_id } => {
                self.any_worker_ready = true;
                self.metrics.record_worker_event("ready");
                if let Some(worker) = self.workers.get_mut(&worker_id) {
                    worker.listening = true;
                    // A worker that came up after shutdown began must still
                    // hear the decision it missed.
                    if self.state == PoolState::Stopping {
                        if let Some(message) = self.last_shutdown_message {
                            let _ = worker.control.send(message);
                        }
                    }
                }
                self.evaluate_rollover();
            }
            WorkerEvent::Exited { worker_id, outcome } => {
                self.workers.remove(&worker_id);
                self.metrics.record_worker_event("exited");
                match outcome {
                    Ok(()) => tracing::info!(worker_id, "worker exited"),
                    Err(err) => {
                        self.unclean_exit = true;
                        tracing::error!(worker_id, err = format!("{err:#}"), "worker failed");
                    }
                }
                if self
                    .rollover
                    .as_ref()
                    .is_some_and(|rollover| rollover.worker_id == worker_id)
                {
                    self.rollover = None;
                    self.metrics.record_worker_event("rolled");
                }
                if !self.any_worker_ready && self.state == PoolState::Running {
                    self.startup_exits += 1;
                    if self.startup_exits >= self.desired {
                        self.declare_startup_failure();
                    }
                }
            }
        }
    }

    fn declare_startup_failure(&mut self) {
        tracing::error!("no worker ever reached the listening state; shutting down");
        self.startup_failed = true;
        self.state = PoolState::Stopping;
        self.broadcast(PrimaryMessage::BeginGracefulShutdown);
        let now = Instant::now();
        self.stopping_accelerate_at = Some(now + STARTUP_FAILURE_ACCELERATE_AFTER);
        self.stopping_immediate_at = Some(now + STARTUP_FAILURE_IMMEDIATE_AFTER);
    }

    fn handle_shutdown_signal(&mut self) {
        self.signal_count += 1;
        let phase = escalation_phase(
            self.signal_count,
            self.config.shutdown_signal_count_accelerated,
            self.config.shutdown_signal_count_immediate,
        );
        tracing::info!(count = self.signal_count, ?phase, "shutdown signal received");
        self.state = PoolState::Stopping;
        match phase {
            ShutdownPhase::Graceful => self.broadcast(PrimaryMessage::BeginGracefulShutdown),
            ShutdownPhase::Accelerated => self.broadcast(PrimaryMessage::BeginForcefulShutdown),
            ShutdownPhase::Immediate => self.kill_all_workers(),
            ShutdownPhase::Listening => unreachable!(),
        }
    }

    fn kill_all_workers(&mut self) {
        let killed = self.workers.len();
        for (_, worker) in self.workers.drain() {
            worker.task.abort();
            self.metrics.record_worker_event("killed");
        }
        if killed > 0 {
            self.unclean_exit = true;
        }
    }

    fn handle_sighup(&mut self) {
        self.generation += 1;
        tracing::info!(generation = self.generation, "rolling restart requested");
        self.evaluate_rollover();
    }

    fn evaluate_rollover(&mut self) {
        if self.state != PoolState::Running || self.rollover.is_some() {
            return;
        }
        let Some(worker_id) = select_rollover(&self.views(), self.generation, self.desired) else {
            return;
        };
        tracing::info!(worker_id, "rolling over worker");
        if let Some(worker) = self.workers.get(&worker_id) {
            let _ = worker.control.send(PrimaryMessage::BeginGracefulShutdown);
        }
        let now = Instant::now();
        self.rollover = Some(RolloverState {
            worker_id,
            accelerate_at: now + ROLLOVER_ACCELERATE_AFTER,
            immediate_at: now + ROLLOVER_IMMEDIATE_AFTER,
            escalated: false,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines: Vec<Instant> = Vec::new();
        if let Some(rollover) = &self.rollover {
            deadlines.push(if rollover.escalated {
                rollover.immediate_at
            } else {
                rollover.accelerate_at
            });
        }
        if let Some(at) = self.stopping_accelerate_at {
            deadlines.push(at);
        }
        if let Some(at) = self.stopping_immediate_at {
            deadlines.push(at);
        }
        deadlines.into_iter().min()
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();

        let mut expired_rollover = None;
        if let Some(rollover) = &mut self.rollover {
            if now >= rollover.immediate_at {
                expired_rollover = Some(rollover.worker_id);
            } else if now >= rollover.accelerate_at && !rollover.escalated {
                rollover.escalated = true;
                let worker_id = rollover.worker_id;
                if let Some(worker) = self.workers.get(&worker_id) {
                    let _ = worker.control.send(PrimaryMessage::BeginForcefulShutdown);
                }
                tracing::warn!(worker_id, "rollover escalated to forceful shutdown");
            }
        }
        if let Some(worker_id) = expired_rollover {
            if let Some(worker) = self.workers.remove(&worker_id) {
                worker.task.abort();
                self.unclean_exit = true;
                self.metrics.record_worker_event("killed");
                tracing::warn!(worker_id, "rollover worker killed after the immediate bound");
            }
            self.rollover = None;
        }

        if let Some(at) = self.stopping_accelerate_at {
            if now >= at {
                self.stopping_accelerate_at = None;
                self.broadcast(PrimaryMessage::BeginForcefulShutdown);
            }
        }
        if let Some(at) = self.stopping_immediate_at {
            if now >= at {
                self.stopping_immediate_at = None;
                self.kill_all_workers();
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Runs the worker pool until shutdown resolves. Errors mean a non-zero
/// process exit: startup failure or an unclean worker exit.
pub async fn run_cluster(
    config: Config,
    store: Arc<dyn BackupStore>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    use tokio::signal::unix::SignalKind;

    let config = Arc::new(config);
    let desired = desired_workers(&config);
    tracing::info!(desired, "starting worker pool");

    let mut term = server::subscribe(
        &config.shutdown_signals,
        ShutdownSignal::Term,
        SignalKind::terminate(),
    )?;
    let mut int = server::subscribe(
        &config.shutdown_signals,
        ShutdownSignal::Int,
        SignalKind::interrupt(),
    )?;
    let mut hup = Some(
        tokio::signal::unix::signal(SignalKind::hangup())
            .map_err(|err| anyhow::anyhow!("failed to install SIGHUP handler: {err}"))?,
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut supervisor = Supervisor {
        config: config.clone(),
        store,
        metrics,
        events_tx,
        workers: HashMap::new(),
        state: PoolState::Running,
        desired,
        generation: 0,
        next_worker_id: 0,
        last_spawn: None,
        any_worker_ready: false,
        startup_exits: 0,
        startup_failed: false,
        unclean_exit: false,
        signal_count: 0,
        last_shutdown_message: None,
        rollover: None,
        stopping_accelerate_at: None,
        stopping_immediate_at: None,
    };

    let spawn_period = config.cluster_add_worker_debounce.max(Duration::from_millis(1));
    let mut spawn_ticker = tokio::time::interval(spawn_period);
    let mut rollover_ticker = tokio::time::interval(ROLLOVER_SAFETY_INTERVAL);

    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => supervisor.handle_event(event),
            _ = spawn_ticker.tick() => supervisor.maybe_spawn(),
            _ = rollover_ticker.tick() => supervisor.evaluate_rollover(),
            _ = server::wait_signal(&mut term) => supervisor.handle_shutdown_signal(),
            _ = server::wait_signal(&mut int) => supervisor.handle_shutdown_signal(),
            _ = server::wait_signal(&mut hup) => supervisor.handle_sighup(),
            _ = sleep_until_opt(supervisor.next_deadline()) => supervisor.handle_deadlines(),
        }

        if supervisor.state == PoolState::Stopping && supervisor.workers.is_empty() {
            break;
        }
    }

    if supervisor.startup_failed {
        anyhow::bail!("all workers failed to start");
    }
    if supervisor.unclean_exit {
        anyhow::bail!("one or more workers exited uncleanly");
    }
    tracing::info!("worker pool stopped cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state_with;

    #[test]
    fn sizing_follows_the_memory_budget() {
        let gib = 1024 * 1024 * 1024u64;
        let mib = 1024 * 1024u64;

        // ⌊(1 GiB − 128 MiB − 0) / 256 MiB⌋ = 3
        assert_eq!(pool_size(1, 16, 128 * mib, 256 * mib, gib, 0), 3);
        // Reserved memory shrinks the budget.
        assert_eq!(pool_size(1, 16, 128 * mib, 256 * mib, gib, 384 * mib), 2);
        // Capped by max.
        assert_eq!(pool_size(1, 2, 128 * mib, 256 * mib, gib, 0), 2);
        // Raised to min.
        assert_eq!(pool_size(4, 16, 128 * mib, 256 * mib, 512 * mib, 0), 4);
        // Hard floor of one even when the budget fits nothing.
        assert_eq!(pool_size(0, 16, gib, 256 * mib, gib, 0), 1);
        // Zero worker estimate means no constraint.
        assert_eq!(pool_size(1, 12, 128 * mib, 0, gib, 0), 12);
    }

    #[test]
    fn rollover_picks_the_oldest_prior_generation_worker() {
        let workers = [
            WorkerView { id: 3, generation: 0, listening: true },
            WorkerView { id: 5, generation: 0, listening: true },
            WorkerView { id: 7, generation: 1, listening: true },
        ];
        assert_eq!(select_rollover(&workers, 1, 3), Some(3));
    }

    #[test]
    fn rollover_waits_for_another_listening_worker() {
        // Sole worker of the old generation and nothing else listening yet.
        let workers = [
            WorkerView { id: 3, generation: 0, listening: true },
            WorkerView { id: 7, generation: 1, listening: false },
        ];
        assert_eq!(select_rollover(&workers, 1, 2), None);
        // Unless the pool is sized to a single worker.
        assert_eq!(select_rollover(&workers, 1, 1), Some(3));
    }

    #[test]
    fn rollover_is_idle_when_everyone_is_current() {
        let workers = [
            WorkerView { id: 3, generation: 2, listening: true },
            WorkerView { id: 5, generation: 2, listening: true },
        ];
        assert_eq!(select_rollover(&workers, 2, 2), None);
    }

    #[tokio::test]
    async fn worker_serves_until_asked_to_stop() {
        let (state, _tmp) = test_state_with(|config| {
            config.cluster_standalone = false;
        });
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(
            0,
            0,
            state.config.clone(),
            state.store.clone(),
            state.metrics.clone(),
            events_tx,
        );

        let ready = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("worker reports in time")
            .expect("event channel open");
        assert!(matches!(ready, WorkerEvent::Ready { worker_id: 0 }));

        worker
            .control
            .send(PrimaryMessage::BeginGracefulShutdown)
            .unwrap();
        let exited = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("worker exits in time")
            .expect("event channel open");
        match exited {
            WorkerEvent::Exited { worker_id, outcome } => {
                assert_eq!(worker_id, 0);
                assert!(outcome.is_ok(), "{outcome:?}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_workers_failing_to_bind_is_a_startup_failure() {
        let blocker = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            // Sandbox environments can block binding attempts.
            Err(_) => return,
        };
        let port = blocker.local_addr().unwrap().port();

        let (state, _tmp) = test_state_with(|config| {
            config.http_port = port;
            config.cluster_standalone = false;
            config.cluster_min_workers = 1;
            config.cluster_max_workers = 2;
            // No memory constraint: the pool sizes to max_workers.
            config.cluster_estimated_memory_worker = 0;
            config.cluster_add_worker_debounce = Duration::from_millis(10);
        });

        let result = tokio::time::timeout(
            Duration::from_secs(15),
            run_cluster(
                (*state.config).clone(),
                state.store.clone(),
                state.metrics.clone(),
            ),
        )
        .await
        .expect("startup failure resolves quickly");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("all workers failed to start"));
        drop(blocker);
    }
}
