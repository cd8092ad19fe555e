use std::sync::Arc;

use crate::config::Config;
use crate::inflight::InflightRegistry;
use crate::metrics::Metrics;
use crate::storage::BackupStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn BackupStore>,
    pub metrics: Arc<Metrics>,
    pub inflight: Arc<InflightRegistry>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn BackupStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            metrics,
            inflight: Arc::new(InflightRegistry::new()),
        }
    }
}
