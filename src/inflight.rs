use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Entry {
    started_at: Instant,
    cancel: CancellationToken,
}

/// Requests currently being served by this worker. The soft-timeout sweeper
/// and the accelerated-shutdown phase both cancel through here.
#[derive(Default)]
pub struct InflightRegistry {
    requests: Mutex<HashMap<Uuid, Entry>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a new request and hands back its cancel handle.
    pub fn register(&self, reqid: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut requests = self.requests.lock().expect("inflight lock");
        requests.insert(
            reqid,
            Entry {
                started_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn complete(&self, reqid: &Uuid) {
        let mut requests = self.requests.lock().expect("inflight lock");
        requests.remove(reqid);
    }

    pub fn len(&self) -> usize {
        self.requests.lock().expect("inflight lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels and drops every request older than `max_age`; returns how many
    /// were swept.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut requests = self.requests.lock().expect("inflight lock");
        let expired: Vec<Uuid> = requests
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.started_at) > max_age)
            .map(|(reqid, _)| *reqid)
            .collect();
        for reqid in &expired {
            if let Some(entry) = requests.remove(reqid) {
                entry.cancel.cancel();
            }
        }
        expired.len()
    }

    /// Cancels everything still running; accelerated shutdown.
    pub fn cancel_all(&self) -> usize {
        let mut requests = self.requests.lock().expect("inflight lock");
        let count = requests.len();
        for (_, entry) in requests.drain() {
            entry.cancel.cancel();
        }
        count
    }
}
