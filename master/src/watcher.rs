//! Watcher de event logs: escaneo periódico, detección de cambios y reparto
//! de grupos a un pool acotado de workers.

use anyhow::{Context, Result};
use common::discovery::{self, LogFile, LogGroup};
use common::format_duration;
use common::parser::{ParseSession, TraceParser};
use common::writer::BatchWriter;
use common::{EntityStore, InsightConfig, LogFileStatus, ParsedLogFile, StoreError};
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    sync::{watch, Semaphore},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::state::AppState;

/// Loop principal: un tick por intervalo hasta que llegue la señal de apagado.
pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    if !state.config.scheduler_enabled {
        info!("scheduler deshabilitado, el watcher no escanea");
        return;
    }

    let permits = Arc::new(Semaphore::new(state.config.parse_workers.max(1)));
    let mut ticker = interval(state.config.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "watcher escaneando {} cada {} con {} workers",
        state.config.event_log_path.display(),
        format_duration(state.config.scan_interval.as_millis() as i64),
        state.config.parse_workers
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match dispatch_scan(&state, &permits).await {
                    Ok(handles) if !handles.is_empty() => {
                        debug!("{} grupos despachados", handles.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("escaneo falló: {e:#}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("watcher detenido");
                    break;
                }
            }
        }
    }
}

/// Un ciclo de escaneo: agrupa, filtra lo que no cambió y lanza un worker por
/// grupo pendiente. Los handles sirven para esperar el ciclo en tests.
pub async fn dispatch_scan(
    state: &AppState,
    permits: &Arc<Semaphore>,
) -> Result<Vec<JoinHandle<()>>> {
    let root = state.config.event_log_path.clone();
    let prefixes = state.config.file_prefixes.clone();
    let files = tokio::task::spawn_blocking(move || discovery::scan(&root, &prefixes))
        .await
        .context("escaneo abortado")??;

    let mut handles = Vec::new();

    for group in discovery::group_files(files) {
        let label = group.label();

        let pending = match pending_files(state.store.as_ref(), &group) {
            Ok(p) => p,
            Err(e) => {
                warn!("no se pudo consultar el ledger de {}: {e}", label);
                continue;
            }
        };
        if pending.is_empty() {
            continue;
        }

        let keys = group.files.iter().map(LogFile::key).collect();
        let Some(guard) = state.try_claim(keys) else {
            debug!("grupo {} todavía en proceso, se saltea este ciclo", label);
            continue;
        };

        let store = state.store.clone();
        let config = state.config.clone();
        let permits = permits.clone();

        handles.push(tokio::spawn(async move {
            let Ok(permit) = permits.acquire_owned().await else {
                warn!("pool de workers cerrado, grupo {} descartado", label);
                return;
            };
            let handle = Handle::current();

            let res = tokio::task::spawn_blocking(move || {
                let _guard = guard;
                let _permit = permit;
                process_group(store, &config, &group, &pending, &handle)
            })
            .await;

            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("grupo {} terminó con error: {e:#}", label),
                Err(e) => error!("worker del grupo {} abortado: {e}", label),
            }
        }));
    }

    Ok(handles)
}

/// Archivos del grupo que hay que (re)parsear, en el orden del grupo.
///
/// Reparsear un archivo vuelve a aplicar sus eventos, y un archivo posterior
/// puede haber avanzado después el estado de jobs y stages. Por eso, desde el
/// primer archivo que cambió, entran también todos los que le siguen.
fn pending_files(store: &dyn EntityStore, group: &LogGroup) -> Result<Vec<LogFile>, StoreError> {
    let mut pending = Vec::new();
    let mut cascade = false;
    for file in &group.files {
        if cascade {
            debug!("reparseo en cascada de {}", file.name);
            pending.push(file.clone());
            continue;
        }
        match store.get_parsed_log(&file.key())? {
            None => {
                info!("event log nuevo: {}", file.name);
                pending.push(file.clone());
                cascade = true;
            }
            Some(row) if row.needs_reparse(file.last_modified, file.size) => {
                info!(
                    "reparseo de {} (estado {:?}, tamaño {} -> {}, mtime {} -> {})",
                    file.name,
                    row.status,
                    row.file_size,
                    file.size,
                    row.last_modified,
                    file.last_modified
                );
                pending.push(file.clone());
                cascade = true;
            }
            Some(_) => {}
        }
    }
    Ok(pending)
}

/// Worker de un grupo. Corre en el pool bloqueante: archivos en secuencia,
/// cierre de la aplicación y checkpoint del store.
fn process_group(
    store: Arc<dyn EntityStore>,
    config: &InsightConfig,
    group: &LogGroup,
    pending: &[LogFile],
    handle: &Handle,
) -> Result<()> {
    let parser = TraceParser::new(store.clone(), config);
    let writer = BatchWriter::spawned(store.clone(), handle);

    let known_app = match group.app_id.as_deref() {
        Some(app_id) => store.get_application(app_id)?.map(|_| app_id),
        None => None,
    };
    let mut session = match known_app {
        Some(app_id) => ParseSession::resume(writer, store.as_ref(), app_id)?,
        None => {
            let mut s = ParseSession::new(writer);
            s.app_id = group.app_id.clone();
            s
        }
    };

    let total = pending.len();
    for (i, file) in pending.iter().enumerate() {
        let key = file.key();
        store.put_parsed_log(ParsedLogFile::new(
            &key,
            file.last_modified,
            file.size,
            LogFileStatus::Processing,
        ))?;

        let row = match parser.parse_file(&mut session, &file.path, i + 1, total) {
            Ok(_) => ParsedLogFile::new(&key, file.last_modified, file.size, LogFileStatus::Success),
            Err(e) => {
                error!("fallo parseando {}: {e:#}", file.name);
                let mut row =
                    ParsedLogFile::new(&key, file.last_modified, file.size, LogFileStatus::Failed);
                row.error = Some(format!("{e:#}"));
                row
            }
        };
        store.put_parsed_log(row)?;
    }

    if let Err(e) = parser.finish(&mut session) {
        error!("no se pudo cerrar {}: {e:#}", group.label());
    }

    store.checkpoint().context("checkpoint del store")?;
    Ok(())
}
