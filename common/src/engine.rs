//! Post-cálculo de una aplicación ya ingerida.
//!
//! Lee las tasks de la app, agrupa por (stage, intento) y recalcula desde cero
//! las métricas de cada stage, la tabla de estadísticas, los contadores de
//! jobs y executors y los scores. Correrlo dos veces da el mismo resultado.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::DiagnosisConfig;
use crate::diagnosis::{self, DiagnosisReport};
use crate::error::InsightError;
use crate::executor::ExecutorMetrics;
use crate::stage::{StageMetrics, StageStatistics, StageStatus, StatMetric};
use crate::store::EntityStore;
use crate::task::{TaskRecord, TaskStatus};

/* =========================
   PERCENTILES
   ========================= */

/// Percentil nearest-rank sobre una serie ya ordenada: índice ceil(p·n) − 1.
pub fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (p * n as f64).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(n - 1)])
}

/// min/p25/p50/p75/p95/max de una serie (se ordena acá).
fn distribution(mut values: Vec<i64>) -> Option<[i64; 6]> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let p = |q: f64| percentile(&values, q).unwrap_or(0);
    Some([
        values[0],
        p(0.25),
        p(0.50),
        p(0.75),
        p(0.95),
        values[values.len() - 1],
    ])
}

fn metric_value(t: &TaskRecord, metric: StatMetric) -> i64 {
    match metric {
        StatMetric::Duration => t.duration,
        StatMetric::GcTime => t.gc_time.unwrap_or(0),
        StatMetric::InputBytes => t.input_bytes.unwrap_or(0),
        StatMetric::ShuffleReadBytes => t.shuffle_read_bytes.unwrap_or(0),
    }
}

/* =========================
   STAGES
   ========================= */

/// Métricas de un intento de stage a partir de sus tasks.
pub fn stage_metrics(tasks: &[&TaskRecord]) -> StageMetrics {
    let mut m = StageMetrics::default();
    if tasks.is_empty() {
        return m;
    }

    for t in tasks {
        m.input_bytes = m.input_bytes.saturating_add(t.input_bytes.unwrap_or(0));
        m.input_records = m.input_records.saturating_add(t.input_records.unwrap_or(0));
        m.output_bytes = m.output_bytes.saturating_add(t.output_bytes.unwrap_or(0));
        m.output_records = m.output_records.saturating_add(t.output_records.unwrap_or(0));
        m.shuffle_read_bytes = m.shuffle_read_bytes
            .saturating_add(t.shuffle_read_bytes.unwrap_or(0));
        m.shuffle_read_records = m.shuffle_read_records
            .saturating_add(t.shuffle_read_records.unwrap_or(0));
        m.shuffle_write_bytes = m.shuffle_write_bytes
            .saturating_add(t.shuffle_write_bytes.unwrap_or(0));
        m.shuffle_write_records = m.shuffle_write_records
            .saturating_add(t.shuffle_write_records.unwrap_or(0));

        let gc = t.gc_time.unwrap_or(0);
        m.gc_time_sum = m.gc_time_sum.saturating_add(gc);
        m.gc_time_max = m.gc_time_max.max(gc);
        m.tasks_duration_sum = m.tasks_duration_sum.saturating_add(t.duration);
        m.scheduler_delay_sum = m.scheduler_delay_sum
            .saturating_add(t.scheduler_delay.unwrap_or(0));
        m.peak_execution_memory_max = m
            .peak_execution_memory_max
            .max(t.peak_execution_memory.unwrap_or(0));
        m.memory_bytes_spilled_sum = m.memory_bytes_spilled_sum
            .saturating_add(t.memory_bytes_spilled.unwrap_or(0));

        let disk = t.disk_bytes_spilled.unwrap_or(0);
        m.disk_bytes_spilled_sum = m.disk_bytes_spilled_sum.saturating_add(disk);
        if disk > 0 {
            m.spilled_tasks += 1;
        }

        match t.status {
            TaskStatus::Success => m.num_completed_tasks += 1,
            TaskStatus::Failed => m.num_failed_tasks += 1,
            TaskStatus::Unknown => {}
        }
    }
    m.task_count = tasks.len() as u32;

    let mut durations: Vec<i64> = tasks.iter().map(|t| t.duration).collect();
    durations.sort_unstable();
    m.duration_p50 = percentile(&durations, 0.50);
    m.duration_p75 = percentile(&durations, 0.75);
    m.duration_p95 = percentile(&durations, 0.95);
    m.duration_p99 = percentile(&durations, 0.99);
    m.max_task_duration = durations.last().copied();
    m
}

fn statistics_rows(
    app_id: &str,
    stage_id: i32,
    attempt_id: i32,
    tasks: &[&TaskRecord],
) -> Vec<StageStatistics> {
    StatMetric::ALL
        .iter()
        .filter_map(|metric| {
            let values = tasks.iter().map(|t| metric_value(t, *metric)).collect();
            distribution(values).map(|[min, p25, p50, p75, p95, max]| StageStatistics {
                id: format!("{}:{}:{}:{}", app_id, stage_id, attempt_id, metric.as_str()),
                app_id: app_id.to_string(),
                stage_id,
                attempt_id,
                metric: *metric,
                min,
                p25,
                p50,
                p75,
                p95,
                max,
            })
        })
        .collect()
}

/* =========================
   EXECUTORS
   ========================= */

pub fn executor_metrics(tasks: &[&TaskRecord]) -> ExecutorMetrics {
    let mut m = ExecutorMetrics::default();
    for t in tasks {
        match t.status {
            TaskStatus::Success => m.completed_tasks += 1,
            TaskStatus::Failed => m.failed_tasks += 1,
            TaskStatus::Unknown => {}
        }
        m.total_duration = m.total_duration.saturating_add(t.duration);
        m.total_gc_time = m.total_gc_time.saturating_add(t.gc_time.unwrap_or(0));
        m.total_input_bytes = m.total_input_bytes.saturating_add(t.input_bytes.unwrap_or(0));
        m.total_shuffle_read = m.total_shuffle_read
            .saturating_add(t.shuffle_read_bytes.unwrap_or(0));
        m.total_shuffle_write = m.total_shuffle_write
            .saturating_add(t.shuffle_write_bytes.unwrap_or(0));
    }
    m
}

/* =========================
   RUN
   ========================= */

/// Recalcula todo lo derivado de una aplicación y devuelve su reporte.
pub fn run(
    store: &dyn EntityStore,
    app_id: &str,
    cfg: &DiagnosisConfig,
) -> Result<DiagnosisReport, InsightError> {
    let mut app = store
        .get_application(app_id)?
        .ok_or_else(|| InsightError::NotFound(app_id.to_string()))?;

    let tasks = store.tasks_for_app(app_id)?;
    let mut by_stage: HashMap<(i32, i32), Vec<&TaskRecord>> = HashMap::new();
    let mut by_executor: HashMap<&str, Vec<&TaskRecord>> = HashMap::new();
    for t in &tasks {
        by_stage.entry((t.stage_id, t.attempt_id)).or_default().push(t);
        by_executor.entry(t.executor_id.as_str()).or_default().push(t);
    }

    // estadísticas por cada (stage, intento) con tasks, tenga o no entidad Stage
    let mut stats: Vec<StageStatistics> = Vec::new();
    for ((stage_id, attempt_id), group) in &by_stage {
        stats.extend(statistics_rows(app_id, *stage_id, *attempt_id, group));
    }
    stats.sort_by(|a, b| a.id.cmp(&b.id));
    store.replace_stage_statistics(app_id, stats)?;

    // stages
    let mut stages = store.stages_for_app(app_id)?;
    let empty: Vec<&TaskRecord> = Vec::new();
    for stage in stages.iter_mut() {
        let group = by_stage
            .get(&(stage.stage_id, stage.attempt_id))
            .unwrap_or(&empty);
        stage.metrics = stage_metrics(group);
        stage.is_skewed = match (stage.metrics.max_task_duration, stage.metrics.duration_p50) {
            (Some(max), Some(p50)) => diagnosis::is_skewed(max, p50, cfg),
            _ => false,
        };
        let verdict = diagnosis::evaluate_stage(stage, cfg);
        stage.issues = verdict.issues;
        stage.performance_score = Some(verdict.score);
        if !stage.issues.is_empty() {
            debug!(
                "stage {}.{} de {}: score {:.0}, {} issues",
                stage.stage_id,
                stage.attempt_id,
                app_id,
                verdict.score,
                stage.issues.len()
            );
        }
        store.upsert_stage(stage.clone())?;
    }

    // jobs
    let mut jobs = store.jobs_for_app(app_id)?;
    for job in jobs.iter_mut() {
        let owned: Vec<_> = stages
            .iter()
            .filter(|s| s.job_id == Some(job.job_id) || job.stage_ids.contains(&s.stage_id))
            .collect();
        job.num_completed_stages = owned
            .iter()
            .filter(|s| s.status == StageStatus::Succeeded)
            .count() as u32;
        job.num_failed_stages = owned
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
            .count() as u32;
        job.num_completed_tasks = owned.iter().map(|s| s.metrics.num_completed_tasks).sum();
        job.num_failed_tasks = owned.iter().map(|s| s.metrics.num_failed_tasks).sum();
        job.performance_score = Some(diagnosis::job_score(
            owned.iter().filter_map(|s| s.performance_score),
        ));
        store.upsert_job(job.clone())?;
    }

    // executors
    for mut exec in store.executors_for_app(app_id)? {
        exec.metrics = by_executor
            .get(exec.executor_id.as_str())
            .map(|g| executor_metrics(g))
            .unwrap_or_default();
        store.upsert_executor(exec)?;
    }

    let job_scores: Vec<f64> = jobs.iter().filter_map(|j| j.performance_score).collect();
    app.health_score = Some(diagnosis::health_score(&job_scores));
    store.upsert_application(app.clone())?;

    info!(
        "post-cálculo de {}: {} tasks, {} stages, {} jobs, salud {:.0}",
        app_id,
        tasks.len(),
        stages.len(),
        jobs.len(),
        app.health_score.unwrap_or(100.0)
    );

    Ok(DiagnosisReport::from_entities(&app, &stages, &jobs))
}

/// Reporte desde lo persistido, sin recalcular.
pub fn load_report(store: &dyn EntityStore, app_id: &str) -> Result<DiagnosisReport, InsightError> {
    let app = store
        .get_application(app_id)?
        .ok_or_else(|| InsightError::NotFound(app_id.to_string()))?;
    let stages = store.stages_for_app(app_id)?;
    let jobs = store.jobs_for_app(app_id)?;
    Ok(DiagnosisReport::from_entities(&app, &stages, &jobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{millis_to_datetime, Application};
    use crate::diagnosis::Issue;
    use crate::executor::Executor;
    use crate::job::Job;
    use crate::stage::Stage;
    use crate::store::MemoryStore;

    fn task(app: &str, stage: i32, id: i64, duration: i64) -> TaskRecord {
        let mut t = TaskRecord::new(app, stage, 0, id);
        t.duration = duration;
        t.status = TaskStatus::Success;
        t.executor_id = "1".to_string();
        t
    }

    fn timed_stage(app: &str, stage_id: i32, job_id: i32, n: u32) -> Stage {
        let mut s = Stage::new(app, stage_id, 0);
        s.job_id = Some(job_id);
        s.num_tasks = n;
        s.status = StageStatus::Succeeded;
        s.submission_time = millis_to_datetime(Some(1_000));
        s.completion_time = millis_to_datetime(Some(5_000));
        s
    }

    #[test]
    fn percentile_nearest_rank() {
        let v: Vec<i64> = (1..=10).collect();
        assert_eq!(percentile(&v, 0.50), Some(5));
        assert_eq!(percentile(&v, 0.95), Some(10));
        assert_eq!(percentile(&v, 0.25), Some(3));
        assert_eq!(percentile(&[7], 0.99), Some(7));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn stage_metrics_suma_y_cuenta() {
        let mut a = task("app", 1, 1, 100);
        a.gc_time = Some(30);
        a.disk_bytes_spilled = Some(2048);
        let mut b = task("app", 1, 2, 300);
        b.gc_time = Some(50);
        b.status = TaskStatus::Failed;
        b.disk_bytes_spilled = Some(0);
        let m = stage_metrics(&[&a, &b]);

        assert_eq!(m.task_count, 2);
        assert_eq!(m.gc_time_sum, 80);
        assert_eq!(m.gc_time_max, 50);
        assert_eq!(m.tasks_duration_sum, 400);
        assert_eq!(m.spilled_tasks, 1);
        assert_eq!(m.disk_bytes_spilled_sum, 2048);
        assert_eq!(m.num_completed_tasks, 1);
        assert_eq!(m.num_failed_tasks, 1);
        assert_eq!(m.duration_p50, Some(100));
        assert_eq!(m.max_task_duration, Some(300));
    }

    #[test]
    fn sumas_saturan_en_vez_de_desbordar() {
        let mut a = task("app", 1, 1, i64::MAX);
        a.input_bytes = Some(i64::MAX);
        a.shuffle_read_bytes = Some(i64::MAX - 1);
        let mut b = task("app", 1, 2, 10);
        b.input_bytes = Some(i64::MAX);
        b.shuffle_read_bytes = Some(5);

        let m = stage_metrics(&[&a, &b]);
        assert_eq!(m.input_bytes, i64::MAX);
        assert_eq!(m.shuffle_read_bytes, i64::MAX);
        assert_eq!(m.tasks_duration_sum, i64::MAX);

        let e = executor_metrics(&[&a, &b]);
        assert_eq!(e.total_input_bytes, i64::MAX);
        assert_eq!(e.total_duration, i64::MAX);
        assert_eq!(e.completed_tasks, 2);
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_application(Application::new("app")).unwrap();

        let mut job = Job::new("app", 0);
        job.stage_ids = vec![0, 1];
        store.upsert_job(job).unwrap();
        store.upsert_stage(timed_stage("app", 0, 0, 10)).unwrap();
        store.upsert_stage(timed_stage("app", 1, 0, 10)).unwrap();
        store.upsert_executor(Executor::new("app", "1")).unwrap();

        let mut rows = Vec::new();
        for i in 0..10 {
            rows.push(task("app", 0, i, 100));
            // stage 1 con una task larga: skew
            rows.push(task("app", 1, 100 + i, if i == 9 { 5_000 } else { 100 }));
        }
        store.bulk_replace_tasks(&rows).unwrap();
        store
    }

    #[test]
    fn run_calcula_scores_de_stage_job_y_app() {
        let store = seeded_store();
        let cfg = DiagnosisConfig::default();
        let report = run(&store, "app", &cfg).unwrap();

        let s0 = store.get_stage("app", 0, 0).unwrap().unwrap();
        let s1 = store.get_stage("app", 1, 0).unwrap().unwrap();
        assert_eq!(s0.performance_score, Some(100.0));
        assert!(!s0.is_skewed);
        assert!(s1.is_skewed);
        assert!(matches!(s1.issues[..], [Issue::Skew { max_task_ms: 5_000, .. }]));
        // ratio 50 → deducción tope de 40
        assert_eq!(s1.performance_score, Some(60.0));

        let job = store.get_job("app", 0).unwrap().unwrap();
        assert_eq!(job.performance_score, Some(60.0));
        assert_eq!(job.num_completed_stages, 2);
        assert_eq!(job.num_completed_tasks, 20);

        assert_eq!(report.health_score, 60.0);
        assert_eq!(report.stages.len(), 2);
        assert_eq!(store.stage_statistics_for("app").unwrap().len(), 8);

        let exec = store.get_executor("app", "1").unwrap().unwrap();
        assert_eq!(exec.metrics.completed_tasks, 20);
    }

    #[test]
    fn run_es_idempotente() {
        let store = seeded_store();
        let cfg = DiagnosisConfig::default();
        run(&store, "app", &cfg).unwrap();
        let first = store.get_stage("app", 1, 0).unwrap().unwrap();
        run(&store, "app", &cfg).unwrap();
        let second = store.get_stage("app", 1, 0).unwrap().unwrap();

        assert_eq!(first.metrics, second.metrics);
        assert_eq!(first.issues, second.issues);
        assert_eq!(store.stage_statistics_for("app").unwrap().len(), 8);
        assert_eq!(
            store.get_executor("app", "1").unwrap().unwrap().metrics.completed_tasks,
            20
        );
    }

    #[test]
    fn run_no_toca_otras_aplicaciones() {
        let store = seeded_store();
        store.upsert_application(Application::new("otra")).unwrap();
        store.upsert_stage(timed_stage("otra", 0, 0, 1)).unwrap();
        store.upsert_task(task("otra", 0, 1, 10)).unwrap();
        let cfg = DiagnosisConfig::default();

        run(&store, "otra", &cfg).unwrap();
        assert!(store.get_stage("app", 1, 0).unwrap().unwrap().performance_score.is_none());
        assert!(store.stage_statistics_for("app").unwrap().is_empty());
        assert_eq!(store.stage_statistics_for("otra").unwrap().len(), 4);
    }

    #[test]
    fn stage_sin_timing_lleva_caveat_y_no_skew() {
        let store = seeded_store();
        let mut s1 = store.get_stage("app", 1, 0).unwrap().unwrap();
        s1.completion_time = None;
        store.upsert_stage(s1).unwrap();

        let report = run(&store, "app", &DiagnosisConfig::default()).unwrap();
        let row = report.stages.iter().find(|s| s.stage_id == 1).unwrap();
        assert!(row.caveat.is_some());
        assert!(row.issues.is_empty());
        assert_eq!(row.score, 100.0);
    }

    #[test]
    fn run_de_app_inexistente_es_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            run(&store, "nope", &DiagnosisConfig::default()),
            Err(InsightError::NotFound(_))
        ));
    }
}
