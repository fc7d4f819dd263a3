//! Reglas de diagnóstico por stage, scoring y estructura del reporte.
//!
//! El engine calcula las métricas de cada stage y luego llama a
//! [`evaluate_stage`]; el resultado (issues + score) queda persistido en el
//! propio `Stage`, así que [`DiagnosisReport::from_entities`] puede rearmar
//! el reporte leyendo el store sin volver a correr nada.

use serde::{Deserialize, Serialize};

use crate::application::{AppId, Application, DataQuality};
use crate::config::DiagnosisConfig;
use crate::job::{Job, JobId};
use crate::stage::Stage;

pub const MAX_SCORE: f64 = 100.0;

/// Caveat para stages sin submission o completion.
pub const INCOMPLETE_TIMING_CAVEAT: &str =
    "Missing submission or completion time; timing rules skipped.";

/// Problema detectado en un stage, con la evidencia que lo disparó.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Issue {
    /// `ratio` es max/p50; `None` cuando p50 es 0.
    Skew {
        max_task_ms: i64,
        p50_ms: i64,
        ratio: Option<f64>,
    },
    /// gcTimeSum / (p50 * numTasks) por encima del umbral.
    GcPressure { gc_time_sum: i64, ratio: f64 },
    /// Al menos una task con GC mayor al umbral.
    TaskGcPressure { max_gc_ms: i64, threshold_ms: i64 },
    DiskSpill { bytes: i64, tasks: u32 },
}

impl Issue {
    /// Puntos que el issue le resta al score del stage.
    pub fn deduction(&self, cfg: &DiagnosisConfig) -> f64 {
        match self {
            Issue::Skew { ratio: Some(r), .. } => {
                (10.0 + 5.0 * (r - cfg.skew_ratio)).clamp(10.0, 40.0)
            }
            Issue::Skew { ratio: None, .. } => 40.0,
            Issue::GcPressure { ratio, .. } => (ratio * 100.0).clamp(5.0, 30.0),
            Issue::TaskGcPressure { .. } => 10.0,
            Issue::DiskSpill { bytes, .. } => {
                let mb = (*bytes).max(0) as f64 / (1024.0 * 1024.0);
                (10.0 + 5.0 * (mb + 1.0).log10()).min(30.0)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Issue::Skew { .. } => "data skew",
            Issue::GcPressure { .. } => "GC pressure",
            Issue::TaskGcPressure { .. } => "long GC pause",
            Issue::DiskSpill { .. } => "disk spill",
        }
    }
}

/// Resultado de aplicar las reglas a un stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageVerdict {
    pub issues: Vec<Issue>,
    pub score: f64,
}

/// `max > skew_ratio * p50`, o `max - p50 > gap` si hay gap configurado.
pub fn is_skewed(max: i64, p50: i64, cfg: &DiagnosisConfig) -> bool {
    let by_ratio = (max as f64) > cfg.skew_ratio * (p50 as f64);
    let by_gap = cfg
        .skew_min_gap_ms
        .map(|gap| max - p50 > gap)
        .unwrap_or(false);
    by_ratio || by_gap
}

/// Aplica las cuatro reglas a un stage con métricas ya calculadas.
/// Las reglas de tiempos (skew y GC agregado) sólo corren con timing completo.
pub fn evaluate_stage(stage: &Stage, cfg: &DiagnosisConfig) -> StageVerdict {
    let m = &stage.metrics;
    let mut issues = Vec::new();
    let timing_ok = stage.has_complete_timing();

    if let (Some(p50), Some(max)) = (m.duration_p50, m.max_task_duration) {
        if timing_ok && stage.is_skewed && max > cfg.skew_min_duration_ms {
            let ratio = (p50 > 0).then(|| max as f64 / p50 as f64);
            issues.push(Issue::Skew {
                max_task_ms: max,
                p50_ms: p50,
                ratio,
            });
        }

        let num_tasks = if stage.num_tasks > 0 {
            stage.num_tasks
        } else {
            m.task_count
        };
        let expected = p50 * i64::from(num_tasks);
        if timing_ok && expected > 0 {
            let ratio = m.gc_time_sum as f64 / expected as f64;
            if ratio > cfg.gc_ratio_threshold {
                issues.push(Issue::GcPressure {
                    gc_time_sum: m.gc_time_sum,
                    ratio,
                });
            }
        }
    }

    if m.gc_time_max > cfg.gc_min_duration_ms {
        issues.push(Issue::TaskGcPressure {
            max_gc_ms: m.gc_time_max,
            threshold_ms: cfg.gc_min_duration_ms,
        });
    }

    if m.spilled_tasks > 0 {
        issues.push(Issue::DiskSpill {
            bytes: m.disk_bytes_spilled_sum,
            tasks: m.spilled_tasks,
        });
    }

    let score = score(&issues, cfg);
    StageVerdict { issues, score }
}

/// 100 menos las deducciones, recortado a [0, 100].
pub fn score(issues: &[Issue], cfg: &DiagnosisConfig) -> f64 {
    let deducted: f64 = issues.iter().map(|i| i.deduction(cfg)).sum();
    (MAX_SCORE - deducted).clamp(0.0, MAX_SCORE)
}

/// Score de un job: el peor de sus stages (100 si no tiene ninguno puntuado).
pub fn job_score<I>(stage_scores: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    stage_scores.into_iter().fold(MAX_SCORE, f64::min)
}

/// Salud de la app: promedio de los scores de sus jobs (100 si no hay jobs).
pub fn health_score(job_scores: &[f64]) -> f64 {
    if job_scores.is_empty() {
        return MAX_SCORE;
    }
    job_scores.iter().sum::<f64>() / job_scores.len() as f64
}

/* ---------------- reporte ---------------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnosis {
    pub stage_id: i32,
    pub attempt_id: i32,
    pub name: String,
    pub num_tasks: u32,
    pub score: f64,
    pub is_skewed: bool,
    pub issues: Vec<Issue>,
    pub caveat: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDiagnosis {
    pub job_id: JobId,
    pub description: Option<String>,
    pub duration_ms: Option<i64>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub app_id: AppId,
    pub app_name: String,
    pub duration_ms: Option<i64>,
    pub health_score: f64,
    pub data_quality: Option<DataQuality>,
    pub data_quality_note: Option<String>,
    pub stages: Vec<StageDiagnosis>,
    pub jobs: Vec<JobDiagnosis>,
}

impl DiagnosisReport {
    /// Arma el reporte desde entidades ya persistidas por el engine.
    pub fn from_entities(app: &Application, stages: &[Stage], jobs: &[Job]) -> Self {
        let mut stage_rows: Vec<StageDiagnosis> = stages
            .iter()
            .map(|s| StageDiagnosis {
                stage_id: s.stage_id,
                attempt_id: s.attempt_id,
                name: s.name.clone(),
                num_tasks: s.num_tasks,
                score: s.performance_score.unwrap_or(MAX_SCORE),
                is_skewed: s.is_skewed,
                issues: s.issues.clone(),
                caveat: (!s.has_complete_timing())
                    .then(|| INCOMPLETE_TIMING_CAVEAT.to_string()),
            })
            .collect();
        stage_rows.sort_by_key(|s| (s.stage_id, s.attempt_id));

        let mut job_rows: Vec<JobDiagnosis> = jobs
            .iter()
            .map(|j| JobDiagnosis {
                job_id: j.job_id,
                description: j.description.clone(),
                duration_ms: j.duration_ms,
                score: j.performance_score.unwrap_or(MAX_SCORE),
            })
            .collect();
        job_rows.sort_by_key(|j| j.job_id);

        let health = app.health_score.unwrap_or_else(|| {
            health_score(&job_rows.iter().map(|j| j.score).collect::<Vec<_>>())
        });

        Self {
            app_id: app.app_id.clone(),
            app_name: app.name.clone(),
            duration_ms: app.duration_ms,
            health_score: health,
            data_quality: app.data_quality,
            data_quality_note: app.data_quality_note.clone(),
            stages: stage_rows,
            jobs: job_rows,
        }
    }

    /// Stages con score < `below`, peor primero.
    pub fn worst_stages(&self, below: f64, limit: usize) -> Vec<&StageDiagnosis> {
        let mut v: Vec<&StageDiagnosis> = self.stages.iter().filter(|s| s.score < below).collect();
        v.sort_by(|a, b| a.score.total_cmp(&b.score));
        v.truncate(limit);
        v
    }

    pub fn worst_jobs(&self, below: f64, limit: usize) -> Vec<&JobDiagnosis> {
        let mut v: Vec<&JobDiagnosis> = self.jobs.iter().filter(|j| j.score < below).collect();
        v.sort_by(|a, b| a.score.total_cmp(&b.score));
        v.truncate(limit);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::millis_to_datetime;

    fn timed_stage(p50: i64, max: i64, num_tasks: u32) -> Stage {
        let mut s = Stage::new("app", 1, 0);
        s.num_tasks = num_tasks;
        s.submission_time = millis_to_datetime(Some(1_000));
        s.completion_time = millis_to_datetime(Some(9_000));
        s.metrics.task_count = num_tasks;
        s.metrics.duration_p50 = Some(p50);
        s.metrics.max_task_duration = Some(max);
        s
    }

    #[test]
    fn skew_debajo_del_piso_no_dispara_la_regla() {
        let cfg = DiagnosisConfig::default();
        // p50=100, max=500: ratio 5 pero 500 <= 1000
        let mut s = timed_stage(100, 500, 10);
        s.is_skewed = is_skewed(500, 100, &cfg);
        assert!(s.is_skewed);
        let v = evaluate_stage(&s, &cfg);
        assert!(v.issues.is_empty());
        assert_eq!(v.score, 100.0);
    }

    #[test]
    fn skew_sobre_el_piso_dispara_la_regla() {
        let cfg = DiagnosisConfig::default();
        let mut s = timed_stage(100, 1_500, 10);
        s.is_skewed = is_skewed(1_500, 100, &cfg);
        let v = evaluate_stage(&s, &cfg);
        assert_eq!(v.issues.len(), 1);
        assert!(matches!(v.issues[0], Issue::Skew { max_task_ms: 1_500, .. }));
        assert!(v.score < 100.0);
    }

    #[test]
    fn is_skewed_acepta_criterio_por_gap() {
        let mut cfg = DiagnosisConfig::default();
        assert!(!is_skewed(1_500, 1_000, &cfg));
        cfg.skew_min_gap_ms = Some(400);
        assert!(is_skewed(1_500, 1_000, &cfg));
    }

    #[test]
    fn stage_sin_timing_no_corre_reglas_de_tiempos() {
        let cfg = DiagnosisConfig::default();
        let mut s = timed_stage(100, 5_000, 10);
        s.completion_time = None;
        s.is_skewed = true;
        s.metrics.gc_time_sum = 10_000;
        s.metrics.gc_time_max = 900;
        let v = evaluate_stage(&s, &cfg);
        // sólo la regla de GC por task, que no depende de los tiempos del stage
        assert_eq!(v.issues.len(), 1);
        assert!(matches!(v.issues[0], Issue::TaskGcPressure { .. }));
    }

    #[test]
    fn gc_agregado_usa_num_tasks_del_stage() {
        let cfg = DiagnosisConfig::default();
        let mut s = timed_stage(1_000, 1_200, 10);
        // 1500 / (1000 * 10) = 0.15
        s.metrics.gc_time_sum = 1_500;
        let v = evaluate_stage(&s, &cfg);
        match &v.issues[..] {
            [Issue::GcPressure { ratio, .. }] => assert!((ratio - 0.15).abs() < 1e-9),
            other => panic!("issues inesperados: {:?}", other),
        }
        assert!((v.score - 85.0).abs() < 1e-9);
    }

    #[test]
    fn spill_reporta_bytes_totales() {
        let cfg = DiagnosisConfig::default();
        let mut s = timed_stage(100, 120, 4);
        s.metrics.spilled_tasks = 2;
        s.metrics.disk_bytes_spilled_sum = 9 * 1024 * 1024;
        let v = evaluate_stage(&s, &cfg);
        assert_eq!(
            v.issues,
            vec![Issue::DiskSpill {
                bytes: 9 * 1024 * 1024,
                tasks: 2
            }]
        );
        // 10 + 5*log10(10) = 15
        assert!((v.score - 85.0).abs() < 1e-9);
    }

    #[test]
    fn deducciones_son_monotonas_en_severidad() {
        let cfg = DiagnosisConfig::default();
        let leve = Issue::Skew { max_task_ms: 3_000, p50_ms: 1_000, ratio: Some(3.0) };
        let grave = Issue::Skew { max_task_ms: 9_000, p50_ms: 1_000, ratio: Some(9.0) };
        assert!(grave.deduction(&cfg) >= leve.deduction(&cfg));

        let poco = Issue::DiskSpill { bytes: 1024, tasks: 1 };
        let mucho = Issue::DiskSpill { bytes: 1 << 40, tasks: 1 };
        assert!(mucho.deduction(&cfg) >= poco.deduction(&cfg));
        assert_eq!(mucho.deduction(&cfg), 30.0);
    }

    #[test]
    fn score_se_recorta_a_cero() {
        let cfg = DiagnosisConfig::default();
        let issues = vec![
            Issue::Skew { max_task_ms: 1, p50_ms: 0, ratio: None },
            Issue::Skew { max_task_ms: 1, p50_ms: 0, ratio: None },
            Issue::Skew { max_task_ms: 1, p50_ms: 0, ratio: None },
        ];
        assert_eq!(score(&issues, &cfg), 0.0);
    }

    #[test]
    fn job_y_health_score() {
        assert_eq!(job_score(Vec::<f64>::new()), 100.0);
        assert_eq!(job_score(vec![90.0, 60.0, 75.0]), 60.0);
        assert_eq!(health_score(&[]), 100.0);
        assert_eq!(health_score(&[60.0, 100.0]), 80.0);
    }
}
