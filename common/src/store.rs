//! Almacén de entidades.
//!
//! `EntityStore` es el contrato que usan parser, writer, engine y watcher.
//! `MemoryStore` es la implementación incluida: una tabla por entidad
//! (`Mutex<BTreeMap>`) y, opcionalmente, un snapshot JSON en disco que se
//! carga al abrir y se reescribe en cada `checkpoint()`.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::application::Application;
use crate::environment::EnvironmentConfig;
use crate::error::{InsightError, StoreError};
use crate::executor::Executor;
use crate::job::{Job, JobId};
use crate::ledger::ParsedLogFile;
use crate::stage::{Stage, StageStatistics};
use crate::task::TaskRecord;

pub trait EntityStore: Send + Sync {
    /* ---- applications ---- */
    fn get_application(&self, app_id: &str) -> Result<Option<Application>, StoreError>;
    fn upsert_application(&self, app: Application) -> Result<(), StoreError>;
    fn list_applications(&self) -> Result<Vec<Application>, StoreError>;

    /* ---- jobs ---- */
    fn get_job(&self, app_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError>;
    fn upsert_job(&self, job: Job) -> Result<(), StoreError>;
    fn jobs_for_app(&self, app_id: &str) -> Result<Vec<Job>, StoreError>;

    /* ---- stages ---- */
    fn get_stage(
        &self,
        app_id: &str,
        stage_id: i32,
        attempt_id: i32,
    ) -> Result<Option<Stage>, StoreError>;
    fn upsert_stage(&self, stage: Stage) -> Result<(), StoreError>;
    fn stages_for_app(&self, app_id: &str) -> Result<Vec<Stage>, StoreError>;

    /* ---- executors ---- */
    fn get_executor(&self, app_id: &str, executor_id: &str)
        -> Result<Option<Executor>, StoreError>;
    fn upsert_executor(&self, executor: Executor) -> Result<(), StoreError>;
    fn executors_for_app(&self, app_id: &str) -> Result<Vec<Executor>, StoreError>;

    /* ---- tasks ---- */
    fn upsert_task(&self, task: TaskRecord) -> Result<(), StoreError>;
    /// Insert-or-replace de un lote completo (todo o nada).
    fn bulk_replace_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError>;
    fn tasks_for_app(&self, app_id: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /* ---- environment ---- */
    fn upsert_env(&self, row: EnvironmentConfig) -> Result<(), StoreError>;
    fn bulk_replace_env(&self, rows: &[EnvironmentConfig]) -> Result<(), StoreError>;
    fn env_for_app(&self, app_id: &str) -> Result<Vec<EnvironmentConfig>, StoreError>;

    /* ---- stage statistics ---- */
    /// Borra las estadísticas de la app y escribe las nuevas.
    fn replace_stage_statistics(
        &self,
        app_id: &str,
        rows: Vec<StageStatistics>,
    ) -> Result<(), StoreError>;
    fn stage_statistics_for(&self, app_id: &str) -> Result<Vec<StageStatistics>, StoreError>;

    /* ---- ledger del watcher ---- */
    fn get_parsed_log(&self, path: &str) -> Result<Option<ParsedLogFile>, StoreError>;
    fn put_parsed_log(&self, row: ParsedLogFile) -> Result<(), StoreError>;
    fn parsed_logs(&self) -> Result<Vec<ParsedLogFile>, StoreError>;

    /// Persiste lo escrito hasta ahora. Sin snapshot configurado no hace nada.
    fn checkpoint(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Devuelve la aplicación sólo si ya está READY.
pub fn ensure_ready(store: &dyn EntityStore, app_id: &str) -> Result<Application, InsightError> {
    let app = store
        .get_application(app_id)?
        .ok_or_else(|| InsightError::NotFound(app_id.to_string()))?;
    if !app.is_ready() {
        let progress = app
            .parsing_progress
            .clone()
            .unwrap_or_else(|| "Parsing".to_string());
        return Err(InsightError::NotReady(progress));
    }
    Ok(app)
}

/* ---------------- MemoryStore ---------------- */

/// Una tabla clave→fila protegida por su propio lock.
struct Table<T> {
    name: &'static str,
    rows: Mutex<BTreeMap<String, T>>,
}

impl<T: Clone> Table<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_rows(name: &'static str, rows: impl IntoIterator<Item = (String, T)>) -> Self {
        Self {
            name,
            rows: Mutex::new(rows.into_iter().collect()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, T>>, StoreError> {
        self.rows.lock().map_err(|_| StoreError::Poisoned(self.name))
    }

    fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: String, row: T) -> Result<(), StoreError> {
        self.lock()?.insert(key, row);
        Ok(())
    }

    fn put_many<'a>(&self, rows: impl Iterator<Item = (&'a str, &'a T)>) -> Result<(), StoreError>
    where
        T: 'a,
    {
        let mut guard = self.lock()?;
        for (k, v) in rows {
            guard.insert(k.to_string(), v.clone());
        }
        Ok(())
    }

    /// Filas cuya clave empieza con "appId:" y que además pertenecen a la app.
    fn scan_app(&self, app_id: &str, belongs: impl Fn(&T) -> bool) -> Result<Vec<T>, StoreError> {
        let prefix = format!("{}:", app_id);
        let guard = self.lock()?;
        Ok(guard
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(_, v)| belongs(v))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn all(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

/// Forma en disco del snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    applications: Vec<Application>,
    jobs: Vec<Job>,
    stages: Vec<Stage>,
    executors: Vec<Executor>,
    tasks: Vec<TaskRecord>,
    environment: Vec<EnvironmentConfig>,
    stage_statistics: Vec<StageStatistics>,
    parsed_logs: Vec<ParsedLogFile>,
}

pub struct MemoryStore {
    applications: Table<Application>,
    jobs: Table<Job>,
    stages: Table<Stage>,
    executors: Table<Executor>,
    tasks: Table<TaskRecord>,
    environment: Table<EnvironmentConfig>,
    stage_statistics: Table<StageStatistics>,
    parsed_logs: Table<ParsedLogFile>,
    snapshot_path: Option<PathBuf>,
    /// Serializa los checkpoints: el último en escribir lleva el estado más nuevo
    checkpoint_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store vacío y sólo en memoria.
    pub fn new() -> Self {
        Self::from_snapshot(Snapshot::default(), None)
    }

    /// Abre un store respaldado por `path`: si el archivo existe se carga.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let bytes = fs::read(&path)?;
            let snap: Snapshot = serde_json::from_slice(&bytes)?;
            info!(
                "snapshot cargado desde {}: {} apps, {} archivos en el ledger",
                path.display(),
                snap.applications.len(),
                snap.parsed_logs.len()
            );
            snap
        } else {
            info!("sin snapshot previo en {}, store vacío", path.display());
            Snapshot::default()
        };
        Ok(Self::from_snapshot(snapshot, Some(path)))
    }

    fn from_snapshot(snap: Snapshot, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            applications: Table::with_rows(
                "applications",
                snap.applications.into_iter().map(|a| (a.app_id.clone(), a)),
            ),
            jobs: Table::with_rows("jobs", snap.jobs.into_iter().map(|j| (j.id.clone(), j))),
            stages: Table::with_rows("stages", snap.stages.into_iter().map(|s| (s.id.clone(), s))),
            executors: Table::with_rows(
                "executors",
                snap.executors.into_iter().map(|e| (e.id.clone(), e)),
            ),
            tasks: Table::with_rows("tasks", snap.tasks.into_iter().map(|t| (t.id.clone(), t))),
            environment: Table::with_rows(
                "environment",
                snap.environment.into_iter().map(|e| (e.id.clone(), e)),
            ),
            stage_statistics: Table::with_rows(
                "stage_statistics",
                snap.stage_statistics.into_iter().map(|s| (s.id.clone(), s)),
            ),
            parsed_logs: Table::with_rows(
                "parsed_logs",
                snap.parsed_logs
                    .into_iter()
                    .map(|p| (p.file_path.clone(), p)),
            ),
            snapshot_path,
            checkpoint_lock: Mutex::new(()),
        }
    }

    /// Copia consistente de todas las tablas (se toman los locks en orden fijo).
    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let applications = self.applications.lock()?;
        let jobs = self.jobs.lock()?;
        let stages = self.stages.lock()?;
        let executors = self.executors.lock()?;
        let tasks = self.tasks.lock()?;
        let environment = self.environment.lock()?;
        let stage_statistics = self.stage_statistics.lock()?;
        let parsed_logs = self.parsed_logs.lock()?;

        Ok(Snapshot {
            applications: applications.values().cloned().collect(),
            jobs: jobs.values().cloned().collect(),
            stages: stages.values().cloned().collect(),
            executors: executors.values().cloned().collect(),
            tasks: tasks.values().cloned().collect(),
            environment: environment.values().cloned().collect(),
            stage_statistics: stage_statistics.values().cloned().collect(),
            parsed_logs: parsed_logs.values().cloned().collect(),
        })
    }
}

impl EntityStore for MemoryStore {
    fn get_application(&self, app_id: &str) -> Result<Option<Application>, StoreError> {
        self.applications.get(app_id)
    }

    fn upsert_application(&self, app: Application) -> Result<(), StoreError> {
        self.applications.put(app.app_id.clone(), app)
    }

    fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        self.applications.all()
    }

    fn get_job(&self, app_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.jobs.get(&Job::key(app_id, job_id))
    }

    fn upsert_job(&self, job: Job) -> Result<(), StoreError> {
        self.jobs.put(job.id.clone(), job)
    }

    fn jobs_for_app(&self, app_id: &str) -> Result<Vec<Job>, StoreError> {
        self.jobs.scan_app(app_id, |j| j.app_id == app_id)
    }

    fn get_stage(
        &self,
        app_id: &str,
        stage_id: i32,
        attempt_id: i32,
    ) -> Result<Option<Stage>, StoreError> {
        self.stages.get(&Stage::key(app_id, stage_id, attempt_id))
    }

    fn upsert_stage(&self, stage: Stage) -> Result<(), StoreError> {
        self.stages.put(stage.id.clone(), stage)
    }

    fn stages_for_app(&self, app_id: &str) -> Result<Vec<Stage>, StoreError> {
        self.stages.scan_app(app_id, |s| s.app_id == app_id)
    }

    fn get_executor(
        &self,
        app_id: &str,
        executor_id: &str,
    ) -> Result<Option<Executor>, StoreError> {
        self.executors.get(&Executor::key(app_id, executor_id))
    }

    fn upsert_executor(&self, executor: Executor) -> Result<(), StoreError> {
        self.executors.put(executor.id.clone(), executor)
    }

    fn executors_for_app(&self, app_id: &str) -> Result<Vec<Executor>, StoreError> {
        self.executors.scan_app(app_id, |e| e.app_id == app_id)
    }

    fn upsert_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        self.tasks.put(task.id.clone(), task)
    }

    fn bulk_replace_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError> {
        self.tasks.put_many(tasks.iter().map(|t| (t.id.as_str(), t)))
    }

    fn tasks_for_app(&self, app_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        self.tasks.scan_app(app_id, |t| t.app_id == app_id)
    }

    fn upsert_env(&self, row: EnvironmentConfig) -> Result<(), StoreError> {
        self.environment.put(row.id.clone(), row)
    }

    fn bulk_replace_env(&self, rows: &[EnvironmentConfig]) -> Result<(), StoreError> {
        self.environment.put_many(rows.iter().map(|r| (r.id.as_str(), r)))
    }

    fn env_for_app(&self, app_id: &str) -> Result<Vec<EnvironmentConfig>, StoreError> {
        self.environment.scan_app(app_id, |e| e.app_id == app_id)
    }

    fn replace_stage_statistics(
        &self,
        app_id: &str,
        rows: Vec<StageStatistics>,
    ) -> Result<(), StoreError> {
        let mut guard = self.stage_statistics.lock()?;
        guard.retain(|_, s| s.app_id != app_id);
        for row in rows {
            guard.insert(row.id.clone(), row);
        }
        Ok(())
    }

    fn stage_statistics_for(&self, app_id: &str) -> Result<Vec<StageStatistics>, StoreError> {
        self.stage_statistics.scan_app(app_id, |s| s.app_id == app_id)
    }

    fn get_parsed_log(&self, path: &str) -> Result<Option<ParsedLogFile>, StoreError> {
        self.parsed_logs.get(path)
    }

    fn put_parsed_log(&self, row: ParsedLogFile) -> Result<(), StoreError> {
        self.parsed_logs.put(row.file_path.clone(), row)
    }

    fn parsed_logs(&self) -> Result<Vec<ParsedLogFile>, StoreError> {
        self.parsed_logs.all()
    }

    fn checkpoint(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _guard = self
            .checkpoint_lock
            .lock()
            .map_err(|_| StoreError::Poisoned("checkpoint"))?;

        let snap = self.snapshot()?;
        let bytes = serde_json::to_vec(&snap)?;

        // temporal único en el mismo directorio + persist (rename atómico)
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!("checkpoint escrito en {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}
