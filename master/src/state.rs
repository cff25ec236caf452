// master/src/state.rs

use std::sync::Arc;

use crate::backend::JobBackend;
use crate::config::Config;
use crate::store::ExecutionStore;
use crate::tracking::TrackingStore;

/// Contexto compartido por los handlers, el driver y el scheduler periódico.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ExecutionStore>,
    pub tracking: Arc<dyn TrackingStore>,
    pub backend: Arc<dyn JobBackend>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn ExecutionStore>,
        tracking: Arc<dyn TrackingStore>,
        backend: Arc<dyn JobBackend>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            tracking,
            backend,
        }
    }
}
