mod backend;
mod config;
mod driver;
mod error;
mod handlers;
mod launcher;
mod lock;
mod periodic;
mod remote;
mod state;
mod store;
mod tracking;

#[cfg(test)]
mod testutil;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::backend::HttpJobBackend;
use crate::config::Config;
use crate::state::AppState;
use crate::store::{ExecutionStore, MemoryStore, SqliteStore};
use crate::tracking::HttpTrackingStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info,tower_http=info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("master terminó con error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let store: Arc<dyn ExecutionStore> = match &config.state_db_path {
        Some(path) => {
            info!("usando store sqlite en {}", path.display());
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            info!("usando store en memoria (STATE_DB_PATH no definido)");
            Arc::new(MemoryStore::new())
        }
    };
    let tracking = Arc::new(HttpTrackingStore::new(
        config.tracking_uri.clone(),
        config.tracking_token.clone(),
    ));
    let backend = Arc::new(HttpJobBackend::new(config.job_backend_url.clone()));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store, tracking, backend);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // disparos periódicos en segundo plano
    let scheduler_state = state.clone();
    tokio::spawn(async move {
        periodic::run_scheduler_loop(scheduler_state).await;
    });

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
