//! Escritura por lotes de tasks y filas de entorno.
//!
//! Cada lote se deduplica (gana la última fila por id), se intenta como un
//! único insert-or-replace y, si el store lo rechaza, se reintenta fila por
//! fila. Los errores se loguean; el llamador nunca los ve.
//!
//! En modo `spawned` los lotes van por un canal a una única tarea de flush
//! que los aplica en orden de envío sobre el pool bloqueante, así el parser
//! sigue decodificando mientras el store escribe. El canal es acotado: si el
//! store se atrasa, el parser se frena en `submit_*` en vez de acumular lotes.

use std::{collections::HashMap, sync::Arc};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, warn};

use crate::environment::EnvironmentConfig;
use crate::store::EntityStore;
use crate::task::TaskRecord;

/// Lotes en cola hacia el flusher antes de frenar al parser.
pub const FLUSH_QUEUE_DEPTH: usize = 8;

enum Command {
    Tasks(Vec<TaskRecord>),
    Env(Vec<EnvironmentConfig>),
    Barrier(oneshot::Sender<()>),
}

enum Mode {
    Inline,
    Spawned(mpsc::Sender<Command>),
}

pub struct BatchWriter {
    store: Arc<dyn EntityStore>,
    mode: Mode,
}

impl BatchWriter {
    /// Escribe en el mismo hilo que envía el lote.
    pub fn inline(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            mode: Mode::Inline,
        }
    }

    /// Arranca la tarea de flush en `handle`. Los `submit_*` y el `drain` de
    /// este modo bloquean el hilo: deben llamarse desde el pool bloqueante.
    pub fn spawned(store: Arc<dyn EntityStore>, handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(FLUSH_QUEUE_DEPTH);
        let flush_store = store.clone();

        handle.spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let store = flush_store.clone();
                match cmd {
                    Command::Tasks(rows) => {
                        let res =
                            tokio::task::spawn_blocking(move || write_tasks(store.as_ref(), rows))
                                .await;
                        if let Err(e) = res {
                            error!("flush de tasks abortado: {e}");
                        }
                    }
                    Command::Env(rows) => {
                        let res =
                            tokio::task::spawn_blocking(move || write_env(store.as_ref(), rows))
                                .await;
                        if let Err(e) = res {
                            error!("flush de entorno abortado: {e}");
                        }
                    }
                    Command::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("flusher terminado");
        });

        Self {
            store,
            mode: Mode::Spawned(tx),
        }
    }

    pub fn submit_tasks(&self, rows: Vec<TaskRecord>) {
        if rows.is_empty() {
            return;
        }
        match &self.mode {
            Mode::Inline => write_tasks(self.store.as_ref(), rows),
            Mode::Spawned(tx) => {
                if let Err(mpsc::error::SendError(Command::Tasks(rows))) =
                    tx.blocking_send(Command::Tasks(rows))
                {
                    warn!("flusher caído, escribiendo {} tasks en línea", rows.len());
                    write_tasks(self.store.as_ref(), rows);
                }
            }
        }
    }

    pub fn submit_env(&self, rows: Vec<EnvironmentConfig>) {
        if rows.is_empty() {
            return;
        }
        match &self.mode {
            Mode::Inline => write_env(self.store.as_ref(), rows),
            Mode::Spawned(tx) => {
                if let Err(mpsc::error::SendError(Command::Env(rows))) =
                    tx.blocking_send(Command::Env(rows))
                {
                    warn!("flusher caído, escribiendo {} filas de entorno en línea", rows.len());
                    write_env(self.store.as_ref(), rows);
                }
            }
        }
    }

    /// Bloquea hasta que todo lo enviado antes quedó escrito.
    /// Debe llamarse desde un hilo bloqueante, nunca desde código async.
    pub fn drain(&self) {
        if let Mode::Spawned(tx) = &self.mode {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.blocking_send(Command::Barrier(done_tx)).is_err() {
                warn!("flusher caído antes del drain");
                return;
            }
            if done_rx.blocking_recv().is_err() {
                warn!("flusher terminó sin confirmar el drain");
            }
        }
    }
}

/// Deja una fila por id: la última enviada, en la posición de la primera.
pub fn dedup_last_wins<T, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        match seen.get(key(&row)) {
            Some(&idx) => out[idx] = row,
            None => {
                seen.insert(key(&row).to_string(), out.len());
                out.push(row);
            }
        }
    }
    out
}

fn write_with_fallback<T, B, S>(kind: &str, rows: Vec<T>, bulk: B, single: S)
where
    B: Fn(&[T]) -> Result<(), crate::error::StoreError>,
    S: Fn(T) -> Result<(), crate::error::StoreError>,
{
    let total = rows.len();
    match bulk(&rows) {
        Ok(()) => debug!("lote de {} {} escrito", total, kind),
        Err(e) => {
            error!("escritura masiva de {} {} falló ({e}), reintentando fila por fila", total, kind);
            let mut failed = 0usize;
            for row in rows {
                if let Err(e) = single(row) {
                    failed += 1;
                    error!("fila de {} descartada: {e}", kind);
                }
            }
            if failed > 0 {
                warn!("{} de {} {} no se pudieron escribir", failed, total, kind);
            }
        }
    }
}

pub fn write_tasks(store: &dyn EntityStore, rows: Vec<TaskRecord>) {
    let rows = dedup_last_wins(rows, |t| t.id.as_str());
    write_with_fallback(
        "tasks",
        rows,
        |batch| store.bulk_replace_tasks(batch),
        |row| store.upsert_task(row),
    );
}

pub fn write_env(store: &dyn EntityStore, rows: Vec<EnvironmentConfig>) {
    let rows = dedup_last_wins(rows, |e| e.id.as_str());
    write_with_fallback(
        "filas de entorno",
        rows,
        |batch| store.bulk_replace_env(batch),
        |row| store.upsert_env(row),
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::application::Application;
    use crate::error::StoreError;
    use crate::executor::Executor;
    use crate::job::{Job, JobId};
    use crate::ledger::ParsedLogFile;
    use crate::stage::{Stage, StageStatistics};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Store que rechaza toda escritura masiva y cuenta los upserts sueltos.
    pub(crate) struct RejectingStore {
        pub inner: MemoryStore,
        pub single_writes: AtomicUsize,
        /// demora de cada upsert suelto
        pub delay: Duration,
    }

    impl RejectingStore {
        pub fn new() -> Self {
            Self::slow(Duration::ZERO)
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                single_writes: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl EntityStore for RejectingStore {
        fn get_application(&self, app_id: &str) -> Result<Option<Application>, StoreError> {
            self.inner.get_application(app_id)
        }
        fn upsert_application(&self, app: Application) -> Result<(), StoreError> {
            self.inner.upsert_application(app)
        }
        fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
            self.inner.list_applications()
        }
        fn get_job(&self, app_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.get_job(app_id, job_id)
        }
        fn upsert_job(&self, job: Job) -> Result<(), StoreError> {
            self.inner.upsert_job(job)
        }
        fn jobs_for_app(&self, app_id: &str) -> Result<Vec<Job>, StoreError> {
            self.inner.jobs_for_app(app_id)
        }
        fn get_stage(&self, a: &str, s: i32, at: i32) -> Result<Option<Stage>, StoreError> {
            self.inner.get_stage(a, s, at)
        }
        fn upsert_stage(&self, stage: Stage) -> Result<(), StoreError> {
            self.inner.upsert_stage(stage)
        }
        fn stages_for_app(&self, app_id: &str) -> Result<Vec<Stage>, StoreError> {
            self.inner.stages_for_app(app_id)
        }
        fn get_executor(&self, a: &str, e: &str) -> Result<Option<Executor>, StoreError> {
            self.inner.get_executor(a, e)
        }
        fn upsert_executor(&self, executor: Executor) -> Result<(), StoreError> {
            self.inner.upsert_executor(executor)
        }
        fn executors_for_app(&self, app_id: &str) -> Result<Vec<Executor>, StoreError> {
            self.inner.executors_for_app(app_id)
        }
        fn upsert_task(&self, task: TaskRecord) -> Result<(), StoreError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.single_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert_task(task)
        }
        fn bulk_replace_tasks(&self, _tasks: &[TaskRecord]) -> Result<(), StoreError> {
            Err(StoreError::BulkRejected("tasks".into()))
        }
        fn tasks_for_app(&self, app_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
            self.inner.tasks_for_app(app_id)
        }
        fn upsert_env(&self, row: EnvironmentConfig) -> Result<(), StoreError> {
            self.single_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert_env(row)
        }
        fn bulk_replace_env(&self, _rows: &[EnvironmentConfig]) -> Result<(), StoreError> {
            Err(StoreError::BulkRejected("environment".into()))
        }
        fn env_for_app(&self, app_id: &str) -> Result<Vec<EnvironmentConfig>, StoreError> {
            self.inner.env_for_app(app_id)
        }
        fn replace_stage_statistics(
            &self,
            app_id: &str,
            rows: Vec<StageStatistics>,
        ) -> Result<(), StoreError> {
            self.inner.replace_stage_statistics(app_id, rows)
        }
        fn stage_statistics_for(&self, app_id: &str) -> Result<Vec<StageStatistics>, StoreError> {
            self.inner.stage_statistics_for(app_id)
        }
        fn get_parsed_log(&self, path: &str) -> Result<Option<ParsedLogFile>, StoreError> {
            self.inner.get_parsed_log(path)
        }
        fn put_parsed_log(&self, row: ParsedLogFile) -> Result<(), StoreError> {
            self.inner.put_parsed_log(row)
        }
        fn parsed_logs(&self) -> Result<Vec<ParsedLogFile>, StoreError> {
            self.inner.parsed_logs()
        }
    }

    fn task(id: i64, duration: i64) -> TaskRecord {
        let mut t = TaskRecord::new("app", 1, 0, id);
        t.duration = duration;
        t
    }

    #[test]
    fn dedup_last_wins_conserva_la_ultima_version() {
        let rows = vec![task(1, 10), task(2, 20), task(1, 11)];
        let out = dedup_last_wins(rows, |t| t.id.as_str());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].task_id, 1);
        assert_eq!(out[0].duration, 11);
        assert_eq!(out[1].task_id, 2);
    }

    #[test]
    fn lote_con_ids_repetidos_deja_una_fila_por_id() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let writer = BatchWriter::inline(store.clone());
        writer.submit_tasks(vec![task(1, 10), task(1, 12), task(2, 5)]);

        let tasks = store.tasks_for_app("app").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks.iter().find(|t| t.task_id == 1).unwrap().duration, 12);
    }

    #[test]
    fn bulk_rechazado_cae_a_escritura_por_fila() {
        let store = Arc::new(RejectingStore::new());
        let writer = BatchWriter::inline(store.clone());
        writer.submit_tasks(vec![task(1, 10), task(2, 20), task(1, 30)]);

        // dedup antes del fallback: dos filas, dos upserts sueltos
        assert_eq!(store.single_writes.load(Ordering::SeqCst), 2);
        assert_eq!(store.tasks_for_app("app").unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_aplica_lotes_en_orden_y_drain_espera() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let handle = Handle::current();
        let st = store.clone();

        tokio::task::spawn_blocking(move || {
            let writer = BatchWriter::spawned(st, &handle);
            writer.submit_tasks(vec![task(1, 10)]);
            writer.submit_tasks(vec![task(1, 20)]);
            writer.submit_tasks(vec![task(1, 30), task(2, 1)]);
            writer.drain();
        })
        .await
        .unwrap();

        let tasks = store.tasks_for_app("app").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks.iter().find(|t| t.task_id == 1).unwrap().duration, 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_lento_frena_al_que_envia() {
        let store = Arc::new(RejectingStore::slow(Duration::from_millis(10)));
        let handle = Handle::current();
        let st: Arc<dyn EntityStore> = store.clone();
        let batches = 3 * FLUSH_QUEUE_DEPTH;

        let submit_time = tokio::task::spawn_blocking(move || {
            let writer = BatchWriter::spawned(st, &handle);
            let started = Instant::now();
            for i in 0..batches {
                writer.submit_tasks(vec![task(i as i64, 1)]);
            }
            let elapsed = started.elapsed();
            writer.drain();
            elapsed
        })
        .await
        .unwrap();

        // con la cola llena, cada envío espera a que el flusher escriba uno
        let min_written = (batches - FLUSH_QUEUE_DEPTH - 1) as u32;
        assert!(submit_time >= Duration::from_millis(10) * min_written);
        assert_eq!(store.single_writes.load(Ordering::SeqCst), batches);
        assert_eq!(store.tasks_for_app("app").unwrap().len(), batches);
    }
}
