//! Parser de event logs: reductor con estado sobre la secuencia de eventos.
//!
//! Un [`ParseSession`] vive lo que dura un grupo de archivos (logs rolling de
//! una misma aplicación): guarda el app id, la versión de Spark vista en
//! LogStart y el índice stage→job, porque los archivos posteriores dependen de
//! lo que establecieron los anteriores. Cada evento se aplica con un
//! read-modify-write contra el store; tasks y filas de entorno se juntan en
//! lotes que van al [`BatchWriter`].

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, Read},
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::application::{
    millis_to_datetime, AppId, Application, DataQuality, ParsingStatus, MISSING_APP_END_NOTE,
};
use crate::config::{DiagnosisConfig, InsightConfig};
use crate::diagnosis::DiagnosisReport;
use crate::discovery::{infer_app_id, Compression, LogGroup};
use crate::engine;
use crate::environment::{EnvCategory, EnvironmentConfig};
use crate::event::{self, value_as_text, PropertyMap, SparkEvent, StageInfo};
use crate::executor::Executor;
use crate::format_duration;
use crate::job::{normalize_description, Job, JobId, JobStatus};
use crate::stage::{Stage, StageStatus};
use crate::store::EntityStore;
use crate::task::{effective_duration, scheduler_delay, TaskRecord, TaskStatus};
use crate::writer::BatchWriter;

/// Estado que cruza todos los archivos de un grupo.
pub struct ParseSession {
    pub app_id: Option<AppId>,
    /// Versión de Spark vista en LogStart
    pub version: Option<String>,
    stage_to_job: HashMap<i32, JobId>,
    writer: BatchWriter,
    tasks: Vec<TaskRecord>,
    env: Vec<EnvironmentConfig>,
}

impl ParseSession {
    pub fn new(writer: BatchWriter) -> Self {
        Self {
            app_id: None,
            version: None,
            stage_to_job: HashMap::new(),
            writer,
            tasks: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Sesión para retomar una aplicación ya conocida: el índice stage→job se
    /// reconstruye desde los jobs guardados, así un archivo posterior del
    /// grupo se puede reparsear sin releer los anteriores.
    pub fn resume(writer: BatchWriter, store: &dyn EntityStore, app_id: &str) -> Result<Self> {
        let mut session = Self::new(writer);
        session.app_id = Some(app_id.to_string());
        if let Some(app) = store.get_application(app_id)? {
            session.version = app.spark_version;
        }
        for job in store.jobs_for_app(app_id)? {
            for sid in job.stage_ids {
                session.stage_to_job.insert(sid, job.job_id);
            }
        }
        Ok(session)
    }

    pub fn job_for_stage(&self, stage_id: i32) -> Option<JobId> {
        self.stage_to_job.get(&stage_id).copied()
    }

    fn flush(&mut self) {
        if !self.tasks.is_empty() {
            self.writer.submit_tasks(std::mem::take(&mut self.tasks));
        }
        if !self.env.is_empty() {
            self.writer.submit_env(std::mem::take(&mut self.env));
        }
    }
}

/// Conteos de un archivo parseado.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub lines: u64,
    pub events: u64,
    pub skipped: u64,
}

pub struct TraceParser {
    store: Arc<dyn EntityStore>,
    batch_size: usize,
    progress_interval: Duration,
    diagnosis: DiagnosisConfig,
}

/// Contexto de progreso del archivo en curso.
struct Progress {
    file_idx: usize,
    total_files: usize,
    lines: u64,
    last_update: Instant,
}

impl Progress {
    fn text(&self) -> String {
        format!(
            "Processing file {}/{} (Lines processed: {})",
            self.file_idx, self.total_files, self.lines
        )
    }
}

impl TraceParser {
    pub fn new(store: Arc<dyn EntityStore>, config: &InsightConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size.max(1),
            progress_interval: config.progress_interval,
            diagnosis: config.diagnosis.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /* ---------------- archivos ---------------- */

    /// Parsea un archivo completo. `file_idx` empieza en 1.
    ///
    /// Los errores de línea se loguean y se saltean; un error de E/S,
    /// descompresión o del store corta el archivo y se devuelve.
    pub fn parse_file(
        &self,
        session: &mut ParseSession,
        path: &Path,
        file_idx: usize,
        total_files: usize,
    ) -> Result<FileStats> {
        let started = Instant::now();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("procesando {} ({}/{})", name, file_idx, total_files);

        if session.app_id.is_none() {
            session.app_id = infer_app_id(&name);
        }

        let mut progress = Progress {
            file_idx,
            total_files,
            lines: 0,
            last_update: Instant::now(),
        };

        if let Some(app_id) = session.app_id.clone() {
            if let Some(mut app) = self.store.get_application(&app_id)? {
                app.parsing_status = ParsingStatus::Parsing;
                app.parsing_progress = Some(progress.text());
                self.store.upsert_application(app)?;
            }
        }

        let mut reader = open_reader(path)?;
        let mut stats = FileStats::default();
        let mut buf = Vec::with_capacity(8 * 1024);

        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("error leyendo {}", path.display()))?;
            if n == 0 {
                break;
            }
            stats.lines += 1;
            progress.lines = stats.lines;

            match event::decode_line(&buf) {
                Ok(Some(ev)) => {
                    stats.events += 1;
                    self.apply(session, ev, &progress)?;
                }
                Ok(None) => {}
                Err(e) => {
                    stats.skipped += 1;
                    warn!("línea {} de {} descartada: {}", stats.lines, name, e);
                }
            }

            if session.tasks.len() >= self.batch_size {
                session.writer.submit_tasks(std::mem::take(&mut session.tasks));
            }
            if session.env.len() >= self.batch_size {
                session.writer.submit_env(std::mem::take(&mut session.env));
            }

            if progress.last_update.elapsed() >= self.progress_interval {
                self.update_progress(session, &progress)?;
                progress.last_update = Instant::now();
            }
        }

        session.flush();

        info!(
            "terminado {} en {}: {} líneas, {} eventos, {} descartadas",
            name,
            format_duration(started.elapsed().as_millis() as i64),
            stats.lines,
            stats.events,
            stats.skipped
        );
        Ok(stats)
    }

    /// Cierre del grupo: espera los lotes pendientes, corre el engine y
    /// finaliza la calidad de datos. La app pasa a READY al final.
    pub fn finish(&self, session: &mut ParseSession) -> Result<Option<DiagnosisReport>> {
        session.flush();
        session.writer.drain();

        let Some(app_id) = session.app_id.clone() else {
            warn!("grupo terminado sin app id, nada que finalizar");
            return Ok(None);
        };
        if self.store.get_application(&app_id)?.is_none() {
            warn!("grupo de {} sin evento identificador de la aplicación", app_id);
            return Ok(None);
        }

        let report = match engine::run(self.store.as_ref(), &app_id, &self.diagnosis) {
            Ok(r) => Some(r),
            Err(e) => {
                error!("post-cálculo de {} falló: {e}", app_id);
                None
            }
        };

        let Some(mut app) = self.store.get_application(&app_id)? else {
            return Ok(report);
        };
        finalize_quality(&mut app);
        app.parsing_status = ParsingStatus::Ready;
        app.parsing_progress = None;
        info!(
            "app {} lista: calidad={:?}, salud={:?}",
            app_id, app.data_quality, app.health_score
        );
        self.store.upsert_application(app)?;

        Ok(report)
    }

    /// Parsea un grupo entero en orden y lo finaliza. Un archivo que falla no
    /// corta el grupo.
    pub fn parse_group(&self, group: &LogGroup, writer: BatchWriter) -> Result<Option<DiagnosisReport>> {
        let mut session = ParseSession::new(writer);
        session.app_id = group.app_id.clone();
        let total = group.files.len();
        for (i, file) in group.files.iter().enumerate() {
            if let Err(e) = self.parse_file(&mut session, &file.path, i + 1, total) {
                error!("fallo parseando {}: {e:#}", file.path.display());
            }
        }
        self.finish(&mut session)
    }

    fn update_progress(&self, session: &ParseSession, progress: &Progress) -> Result<()> {
        let Some(app_id) = session.app_id.as_deref() else {
            return Ok(());
        };
        if let Some(mut app) = self.store.get_application(app_id)? {
            app.parsing_progress = Some(progress.text());
            self.store.upsert_application(app)?;
        }
        Ok(())
    }

    /* ---------------- dispatch ---------------- */

    fn apply(&self, session: &mut ParseSession, ev: SparkEvent, progress: &Progress) -> Result<()> {
        match ev {
            SparkEvent::LogStart(e) => self.on_log_start(session, e.spark_version),
            SparkEvent::ApplicationStart(e) => self.on_app_start(session, e, progress),
            SparkEvent::EnvironmentUpdate(e) => self.on_env_update(session, e, progress),
            SparkEvent::Unrecognized => Ok(()),
            other => {
                let Some(app_id) = session.app_id.clone() else {
                    warn!("evento {} antes de conocer el app id, descartado", other.name());
                    return Ok(());
                };
                match other {
                    SparkEvent::ApplicationEnd(e) => self.on_app_end(&app_id, e.timestamp),
                    SparkEvent::JobStart(e) => self.on_job_start(session, &app_id, e),
                    SparkEvent::JobEnd(e) => self.on_job_end(&app_id, e),
                    SparkEvent::ExecutorAdded(e) => self.on_executor_added(&app_id, e),
                    SparkEvent::ExecutorRemoved(e) => self.on_executor_removed(&app_id, e),
                    SparkEvent::StageSubmitted(e) => {
                        self.on_stage_submitted(session, &app_id, e.stage_info)
                    }
                    SparkEvent::StageCompleted(e) => {
                        self.on_stage_completed(session, &app_id, e.stage_info)
                    }
                    SparkEvent::TaskEnd(e) => {
                        if let Some(task) = build_task(&app_id, e) {
                            session.tasks.push(task);
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /* ---------------- application ---------------- */

    fn on_log_start(&self, session: &mut ParseSession, version: Option<String>) -> Result<()> {
        let Some(version) = version else {
            return Ok(());
        };
        session.version = Some(version.clone());
        if let Some(app_id) = session.app_id.as_deref() {
            if let Some(mut app) = self.store.get_application(app_id)? {
                if app.fill_version(Some(&version)) {
                    self.store.upsert_application(app)?;
                }
            }
        }
        Ok(())
    }

    fn on_app_start(
        &self,
        session: &mut ParseSession,
        ev: event::ApplicationStart,
        progress: &Progress,
    ) -> Result<()> {
        let Some(app_id) = ev.app_id.clone().or_else(|| session.app_id.clone()) else {
            warn!("ApplicationStart sin App ID y sin id inferido, descartado");
            return Ok(());
        };
        session.app_id = Some(app_id.clone());

        let mut app = self
            .store
            .get_application(&app_id)?
            .unwrap_or_else(|| Application::new(app_id.clone()));
        app.parsing_status = ParsingStatus::Parsing;
        app.parsing_progress = Some(progress.text());
        if let Some(name) = ev.app_name {
            app.name = name;
        }
        if let Some(user) = ev.user {
            app.user = user;
        }
        if let Some(start) = millis_to_datetime(ev.timestamp) {
            app.start_time = Some(start);
        }
        app.fill_version(ev.spark_version.as_deref().or(session.version.as_deref()));
        if let (Some(start), Some(end)) = (app.start_time, app.end_time) {
            app.duration_ms = Some((end - start).num_milliseconds());
        }

        debug!("ApplicationStart {}", app_id);
        self.store.upsert_application(app)?;
        Ok(())
    }

    fn on_app_end(&self, app_id: &str, timestamp: i64) -> Result<()> {
        let Some(mut app) = self.store.get_application(app_id)? else {
            warn!("ApplicationEnd para {} sin aplicación creada", app_id);
            return Ok(());
        };
        app.end_time = millis_to_datetime(Some(timestamp));
        app.duration_ms = match (app.start_time, app.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        self.store.upsert_application(app)?;
        Ok(())
    }

    fn on_env_update(
        &self,
        session: &mut ParseSession,
        ev: event::EnvironmentUpdate,
        progress: &Progress,
    ) -> Result<()> {
        if session.app_id.is_none() {
            if let Some(id) = ev.spark_property("spark.app.id") {
                info!("app id {} detectado en EnvironmentUpdate", id);
                session.app_id = Some(id);
            }
        }
        let Some(app_id) = session.app_id.clone() else {
            warn!("EnvironmentUpdate sin app id, descartado");
            return Ok(());
        };

        match self.store.get_application(&app_id)? {
            None => {
                let mut app = Application::new(app_id.clone());
                if let Some(name) = ev.spark_property("spark.app.name") {
                    app.name = name;
                }
                if let Some(user) = ev.spark_property("spark.user.name") {
                    app.user = user;
                }
                app.fill_version(session.version.as_deref());
                app.parsing_progress = Some(progress.text());
                self.store.upsert_application(app)?;
            }
            Some(mut app) => {
                if app.fill_version(session.version.as_deref()) {
                    self.store.upsert_application(app)?;
                }
            }
        }

        let sections: [(&Option<PropertyMap>, EnvCategory); 6] = [
            (&ev.spark_properties, EnvCategory::SparkConf),
            (&ev.jvm_information, EnvCategory::JvmInfo),
            (&ev.hadoop_properties, EnvCategory::HadoopConf),
            (&ev.system_properties, EnvCategory::SystemProps),
            (&ev.metrics_properties, EnvCategory::MetricsProps),
            (&ev.classpath_entries, EnvCategory::ClasspathEntries),
        ];
        for (props, category) in sections {
            if let Some(props) = props {
                session.env.extend(props.iter().map(|(k, v)| {
                    EnvironmentConfig::new(&app_id, category, k, value_as_text(v))
                }));
            }
        }
        Ok(())
    }

    /* ---------------- jobs ---------------- */

    fn on_job_start(
        &self,
        session: &mut ParseSession,
        app_id: &str,
        ev: event::JobStart,
    ) -> Result<()> {
        let mut job = Job::new(app_id, ev.job_id);
        job.submission_time = millis_to_datetime(ev.submission_time);
        job.status = JobStatus::Running;
        job.job_group = ev.property("spark.jobGroup.id");

        let first_stage_name = ev.stage_infos.first().and_then(|s| s.stage_name.clone());
        job.description = [
            ev.property("spark.job.description"),
            job.job_group.clone(),
            first_stage_name,
        ]
        .into_iter()
        .flatten()
        .find_map(|d| normalize_description(&d));

        if ev.stage_infos.is_empty() {
            job.stage_ids = ev.stage_ids.clone();
        } else {
            job.stage_ids = ev.stage_infos.iter().map(|s| s.stage_id).collect();
            job.num_tasks = ev.stage_infos.iter().filter_map(|s| s.num_tasks).sum();
        }
        job.num_stages = job.stage_ids.len() as u32;

        for sid in &job.stage_ids {
            session.stage_to_job.insert(*sid, ev.job_id);
        }

        self.store.upsert_job(job)?;
        Ok(())
    }

    fn on_job_end(&self, app_id: &str, ev: event::JobEnd) -> Result<()> {
        let Some(mut job) = self.store.get_job(app_id, ev.job_id)? else {
            debug!("JobEnd de job {} sin JobStart previo", ev.job_id);
            return Ok(());
        };
        job.completion_time = millis_to_datetime(ev.completion_time);
        job.status = if ev.succeeded() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        if let (Some(start), Some(end)) = (job.submission_time, job.completion_time) {
            job.duration_ms = Some((end - start).num_milliseconds());
        }
        self.store.upsert_job(job)?;
        Ok(())
    }

    /* ---------------- executors ---------------- */

    fn on_executor_added(&self, app_id: &str, ev: event::ExecutorAdded) -> Result<()> {
        let mut exec = self
            .store
            .get_executor(app_id, &ev.executor_id)?
            .unwrap_or_else(|| Executor::new(app_id, &ev.executor_id));
        if let Some(info) = ev.executor_info {
            if let Some(host) = info.host {
                exec.host = host;
            }
            exec.total_cores = info.total_cores.unwrap_or(0);
            exec.memory = info.memory;
        }
        exec.add_time = millis_to_datetime(ev.timestamp);
        exec.remove_time = None;
        exec.loss_reason = None;
        exec.is_active = true;
        self.store.upsert_executor(exec)?;
        Ok(())
    }

    fn on_executor_removed(&self, app_id: &str, ev: event::ExecutorRemoved) -> Result<()> {
        let Some(mut exec) = self.store.get_executor(app_id, &ev.executor_id)? else {
            debug!("ExecutorRemoved de {} sin ExecutorAdded", ev.executor_id);
            return Ok(());
        };
        exec.remove_time = millis_to_datetime(ev.timestamp);
        exec.is_active = false;
        exec.loss_reason = Some(ev.removed_reason.unwrap_or_else(|| "unknown".to_string()));
        self.store.upsert_executor(exec)?;
        Ok(())
    }

    /* ---------------- stages ---------------- */

    fn on_stage_submitted(
        &self,
        session: &mut ParseSession,
        app_id: &str,
        info: StageInfo,
    ) -> Result<()> {
        let mut stage = self
            .store
            .get_stage(app_id, info.stage_id, info.attempt_id)?
            .unwrap_or_else(|| Stage::new(app_id, info.stage_id, info.attempt_id));
        apply_stage_info(&mut stage, session.job_for_stage(info.stage_id), &info);
        stage.status = StageStatus::Running;
        self.store.upsert_stage(stage)?;
        Ok(())
    }

    fn on_stage_completed(
        &self,
        session: &mut ParseSession,
        app_id: &str,
        info: StageInfo,
    ) -> Result<()> {
        let mut stage = match self.store.get_stage(app_id, info.stage_id, info.attempt_id)? {
            Some(s) => s,
            None => {
                // nunca vimos el submit: se arma desde el info del completed
                let mut s = Stage::new(app_id, info.stage_id, info.attempt_id);
                apply_stage_info(&mut s, session.job_for_stage(info.stage_id), &info);
                s
            }
        };

        if stage.submission_time.is_none() {
            stage.submission_time = millis_to_datetime(info.submission_time);
        }
        if let Some(done) = millis_to_datetime(info.completion_time) {
            stage.completion_time = Some(done);
        }
        if let (Some(start), Some(end)) = (stage.submission_time, stage.completion_time) {
            stage.duration_ms = Some((end - start).num_milliseconds());
        }
        stage.status = if info.failure_reason.is_some() {
            StageStatus::Failed
        } else {
            StageStatus::Succeeded
        };
        stage.failure_reason = info.failure_reason;

        self.store.upsert_stage(stage)?;
        Ok(())
    }
}

fn apply_stage_info(stage: &mut Stage, job_id: Option<JobId>, info: &StageInfo) {
    if job_id.is_some() {
        stage.job_id = job_id;
    }
    if let Some(name) = &info.stage_name {
        stage.name = name.clone();
    }
    if let Some(n) = info.num_tasks {
        stage.num_tasks = n;
    }
    if let Some(sub) = millis_to_datetime(info.submission_time) {
        stage.submission_time = Some(sub);
    }
    if !info.parent_ids.is_empty() {
        stage.parent_stage_ids = info.parent_ids.clone();
    }
    if let Some(rdd) = &info.rdd_info {
        stage.rdd_info = Some(rdd.to_string());
    }
}

/// Construye la fila de task de un TaskEnd. Sin "Task Info" no hay task.
fn build_task(app_id: &str, ev: event::TaskEnd) -> Option<TaskRecord> {
    let info = ev.task_info?;
    let stage_id = ev.stage_id.unwrap_or(-1);
    let attempt_id = ev.stage_attempt_id.unwrap_or(0);

    let mut t = TaskRecord::new(app_id, stage_id, attempt_id, info.task_id);
    t.task_index = info.index;
    if let Some(v) = info.executor_id {
        t.executor_id = v;
    }
    if let Some(v) = info.host {
        t.host = v;
    }
    if let Some(v) = info.locality {
        t.locality = v;
    }
    t.speculative = info.speculative.unwrap_or(false);
    t.launch_time = info.launch_time.unwrap_or(0);
    t.finish_time = info.finish_time.unwrap_or(0);
    t.duration = effective_duration(info.duration, t.launch_time, t.finish_time);

    t.status = match ev.end_reason {
        Some(r) if r.reason.as_deref() == Some("Success") => TaskStatus::Success,
        Some(_) => TaskStatus::Failed,
        None => TaskStatus::Unknown,
    };

    if let Some(m) = ev.task_metrics {
        t.executor_deserialize_time = m.executor_deserialize_time;
        t.executor_run_time = m.executor_run_time;
        t.result_serialization_time = m.result_serialization_time;
        t.executor_cpu_time = m.executor_cpu_time;
        t.getting_result_time = info.getting_result_time;
        t.scheduler_delay = Some(scheduler_delay(
            t.duration,
            m.executor_deserialize_time.unwrap_or(0),
            m.executor_run_time.unwrap_or(0),
            m.result_serialization_time.unwrap_or(0),
            info.getting_result_time.unwrap_or(0),
        ));
        t.gc_time = m.jvm_gc_time;
        t.peak_execution_memory = m.peak_execution_memory;
        t.memory_bytes_spilled = m.memory_bytes_spilled;
        t.disk_bytes_spilled = m.disk_bytes_spilled;

        if let Some(input) = m.input {
            t.input_bytes = input.bytes_read;
            t.input_records = input.records_read;
        }
        if let Some(output) = m.output {
            t.output_bytes = output.bytes_written;
            t.output_records = output.records_written;
        }
        if let Some(sr) = m.shuffle_read {
            if sr.remote_bytes_read.is_some() || sr.local_bytes_read.is_some() {
                t.shuffle_read_bytes = Some(
                    sr.remote_bytes_read
                        .unwrap_or(0)
                        .saturating_add(sr.local_bytes_read.unwrap_or(0)),
                );
            }
            t.shuffle_remote_read = sr.remote_bytes_read;
            t.shuffle_read_records = sr.total_records_read;
            t.shuffle_fetch_wait_time = sr.fetch_wait_time;
        }
        if let Some(sw) = m.shuffle_write {
            t.shuffle_write_bytes = sw.bytes_written;
            t.shuffle_write_records = sw.records_written;
            t.shuffle_write_time = sw.write_time;
        }
    }
    Some(t)
}

/// Sin ApplicationEnd → INCOMPLETE con nota; con fin → GOOD salvo que ya
/// hubiera un veredicto. Un INCOMPLETE puesto por falta de fin se levanta si
/// el fin apareció en un archivo posterior.
fn finalize_quality(app: &mut Application) {
    if app.end_time.is_none() {
        app.data_quality = Some(DataQuality::Incomplete);
        app.data_quality_note = Some(MISSING_APP_END_NOTE.to_string());
        return;
    }
    let stale_missing_end = app.data_quality == Some(DataQuality::Incomplete)
        && app.data_quality_note.as_deref() == Some(MISSING_APP_END_NOTE);
    if app.data_quality.is_none() || stale_missing_end {
        app.data_quality = Some(DataQuality::Good);
        app.data_quality_note = None;
    }
}

/// Abre el archivo con el descompresor que indique su sufijo.
fn open_reader(path: &Path) -> Result<BufReader<Box<dyn Read + Send>>> {
    let file = File::open(path).with_context(|| format!("no se pudo abrir {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let inner: Box<dyn Read + Send> = match Compression::from_name(&name) {
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(file)
                .with_context(|| format!("zstd inválido en {}", path.display()))?,
        ),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(file)),
        Compression::None => Box::new(file),
    };
    Ok(BufReader::with_capacity(64 * 1024, inner))
}
