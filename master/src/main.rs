mod handlers;
mod state;
mod watcher;

use crate::state::AppState;
use anyhow::{Context, Result};
use common::{EntityStore, InsightConfig, MemoryStore};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "master=debug,common=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = InsightConfig::from_env();

    let store: Arc<dyn EntityStore> = match &config.snapshot_path {
        Some(path) => {
            let store = MemoryStore::open(path)
                .with_context(|| format!("no se pudo abrir el snapshot {}", path.display()))?;
            info!("store restaurado desde {}", path.display());
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(store.clone(), config);

    // watcher en segundo plano
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher_state = state.clone();
    let watcher_task = tokio::spawn(async move {
        watcher::run(watcher_state, shutdown_rx).await;
    });

    // router HTTP
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", listen_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("señal de apagado recibida");
        })
        .await
        .context("servidor HTTP")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = watcher_task.await {
        error!("watcher terminó con error: {e}");
    }

    if let Err(e) = store.checkpoint() {
        error!("checkpoint final falló: {e}");
    }
    info!("master detenido");
    Ok(())
}
