use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::AppId;
use crate::diagnosis::Issue;
use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Running,
    Failed,
    Succeeded,
}

/// Agregados de un stage calculados a partir de sus tasks.
/// Sólo los escribe el engine de métricas; el parser los deja en cero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub input_bytes: i64,
    pub input_records: i64,
    pub output_bytes: i64,
    pub output_records: i64,
    pub shuffle_read_bytes: i64,
    pub shuffle_read_records: i64,
    pub shuffle_write_bytes: i64,
    pub shuffle_write_records: i64,

    pub gc_time_sum: i64,
    pub gc_time_max: i64,
    pub tasks_duration_sum: i64,
    pub scheduler_delay_sum: i64,
    pub peak_execution_memory_max: i64,
    pub memory_bytes_spilled_sum: i64,
    pub disk_bytes_spilled_sum: i64,
    /// tasks con "Disk Bytes Spilled" > 0
    pub spilled_tasks: u32,

    pub task_count: u32,
    pub num_completed_tasks: u32,
    pub num_failed_tasks: u32,

    // percentiles de duración de task
    pub duration_p50: Option<i64>,
    pub duration_p75: Option<i64>,
    pub duration_p95: Option<i64>,
    pub duration_p99: Option<i64>,
    pub max_task_duration: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// "appId:stageId:attemptId"
    pub id: String,
    pub app_id: AppId,
    pub stage_id: i32,
    pub attempt_id: i32,
    pub job_id: Option<JobId>,
    pub name: String,
    pub num_tasks: u32,
    pub status: StageStatus,
    pub failure_reason: Option<String>,

    pub submission_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    pub parent_stage_ids: Vec<i32>,
    /// Linaje RDD tal cual vino en el evento (JSON)
    pub rdd_info: Option<String>,

    pub metrics: StageMetrics,
    pub is_skewed: bool,
    pub performance_score: Option<f64>,
    pub issues: Vec<Issue>,
}

impl Stage {
    pub fn key(app_id: &str, stage_id: i32, attempt_id: i32) -> String {
        format!("{}:{}:{}", app_id, stage_id, attempt_id)
    }

    pub fn new(app_id: &str, stage_id: i32, attempt_id: i32) -> Self {
        Self {
            id: Self::key(app_id, stage_id, attempt_id),
            app_id: app_id.to_string(),
            stage_id,
            attempt_id,
            job_id: None,
            name: String::new(),
            num_tasks: 0,
            status: StageStatus::Running,
            failure_reason: None,
            submission_time: None,
            completion_time: None,
            duration_ms: None,
            parent_stage_ids: Vec::new(),
            rdd_info: None,
            metrics: StageMetrics::default(),
            is_skewed: false,
            performance_score: None,
            issues: Vec::new(),
        }
    }

    /// Un stage sin submission o completion no sirve para conclusiones de tiempos.
    pub fn has_complete_timing(&self) -> bool {
        self.submission_time.is_some() && self.completion_time.is_some()
    }
}

/// Métrica sobre la que se guardan estadísticas de distribución.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatMetric {
    Duration,
    GcTime,
    InputBytes,
    ShuffleReadBytes,
}

impl StatMetric {
    pub const ALL: [StatMetric; 4] = [
        StatMetric::Duration,
        StatMetric::GcTime,
        StatMetric::InputBytes,
        StatMetric::ShuffleReadBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatMetric::Duration => "duration",
            StatMetric::GcTime => "gc_time",
            StatMetric::InputBytes => "input_bytes",
            StatMetric::ShuffleReadBytes => "shuffle_read_bytes",
        }
    }
}

/// Fila de la tabla stage_statistics: distribución de una métrica en un intento de stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatistics {
    /// "appId:stageId:attemptId:metric"
    pub id: String,
    pub app_id: AppId,
    pub stage_id: i32,
    pub attempt_id: i32,
    pub metric: StatMetric,
    pub min: i64,
    pub p25: i64,
    pub p50: i64,
    pub p75: i64,
    pub p95: i64,
    pub max: i64,
}
