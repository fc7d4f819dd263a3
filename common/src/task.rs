use serde::{Deserialize, Serialize};

use crate::application::AppId;

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failed,
    Unknown,
}

/// Una ejecución terminada de task (un TaskEnd).
///
/// Las métricas son `Option`: `None` significa que el evento no las traía,
/// y para cualquier cálculo su valor por defecto es 0. Se distingue "ausente"
/// de "cero observado" porque algunas reglas (spill) dependen de eso.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// "appId:stageId:taskId" (no incluye el intento del stage)
    pub id: String,
    pub app_id: AppId,
    pub stage_id: i32,
    pub attempt_id: i32,
    pub task_id: TaskId,
    pub task_index: Option<i32>,
    pub executor_id: String,
    pub host: String,
    pub locality: String,
    pub speculative: bool,
    pub status: TaskStatus,

    /// epoch millis
    pub launch_time: i64,
    pub finish_time: i64,
    /// "Duration" explícito o, si falta o es <= 0, finish - launch
    pub duration: i64,

    /// max(0, duration - deserialize - run - serialization - getting result);
    /// `None` si el evento no traía Task Metrics
    pub scheduler_delay: Option<i64>,
    pub getting_result_time: Option<i64>,
    pub executor_deserialize_time: Option<i64>,
    pub executor_run_time: Option<i64>,
    pub result_serialization_time: Option<i64>,
    pub executor_cpu_time: Option<i64>,
    pub gc_time: Option<i64>,
    pub peak_execution_memory: Option<i64>,

    pub input_bytes: Option<i64>,
    pub input_records: Option<i64>,
    pub output_bytes: Option<i64>,
    pub output_records: Option<i64>,

    pub memory_bytes_spilled: Option<i64>,
    pub disk_bytes_spilled: Option<i64>,

    /// remoto + local
    pub shuffle_read_bytes: Option<i64>,
    pub shuffle_remote_read: Option<i64>,
    pub shuffle_read_records: Option<i64>,
    pub shuffle_fetch_wait_time: Option<i64>,
    pub shuffle_write_bytes: Option<i64>,
    pub shuffle_write_records: Option<i64>,
    pub shuffle_write_time: Option<i64>,
}

impl TaskRecord {
    pub fn key(app_id: &str, stage_id: i32, task_id: TaskId) -> String {
        format!("{}:{}:{}", app_id, stage_id, task_id)
    }

    pub fn new(app_id: &str, stage_id: i32, attempt_id: i32, task_id: TaskId) -> Self {
        Self {
            id: Self::key(app_id, stage_id, task_id),
            app_id: app_id.to_string(),
            stage_id,
            attempt_id,
            task_id,
            task_index: None,
            executor_id: "unknown".to_string(),
            host: "unknown".to_string(),
            locality: "unknown".to_string(),
            speculative: false,
            status: TaskStatus::Unknown,
            launch_time: 0,
            finish_time: 0,
            duration: 0,
            scheduler_delay: None,
            getting_result_time: None,
            executor_deserialize_time: None,
            executor_run_time: None,
            result_serialization_time: None,
            executor_cpu_time: None,
            gc_time: None,
            peak_execution_memory: None,
            input_bytes: None,
            input_records: None,
            output_bytes: None,
            output_records: None,
            memory_bytes_spilled: None,
            disk_bytes_spilled: None,
            shuffle_read_bytes: None,
            shuffle_remote_read: None,
            shuffle_read_records: None,
            shuffle_fetch_wait_time: None,
            shuffle_write_bytes: None,
            shuffle_write_records: None,
            shuffle_write_time: None,
        }
    }
}

/// Duración efectiva: la explícita si es positiva, si no finish - launch (nunca negativa).
pub fn effective_duration(explicit: Option<i64>, launch: i64, finish: i64) -> i64 {
    match explicit {
        Some(d) if d > 0 => d,
        _ if finish > launch => finish - launch,
        _ => 0,
    }
}

/// Scheduler delay recortado a cero.
pub fn scheduler_delay(
    duration: i64,
    deserialize: i64,
    run: i64,
    serialization: i64,
    getting_result: i64,
) -> i64 {
    (duration - deserialize - run - serialization - getting_result).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_delay_nunca_es_negativo() {
        // 100 - 40 - 80 - 0 - 0 = -20 -> 0
        assert_eq!(scheduler_delay(100, 40, 80, 0, 0), 0);
        assert_eq!(scheduler_delay(100, 10, 60, 5, 5), 20);
    }

    #[test]
    fn effective_duration_usa_finish_menos_launch_como_fallback() {
        assert_eq!(effective_duration(Some(250), 1_000, 1_100), 250);
        assert_eq!(effective_duration(None, 1_000, 1_100), 100);
        assert_eq!(effective_duration(Some(0), 1_000, 1_100), 100);
        assert_eq!(effective_duration(Some(-5), 1_000, 1_100), 100);
        assert_eq!(effective_duration(None, 1_100, 1_000), 0);
    }

    #[test]
    fn key_no_incluye_el_intento() {
        let a = TaskRecord::new("app", 3, 0, 42);
        let b = TaskRecord::new("app", 3, 1, 42);
        assert_eq!(a.id, b.id);
    }
}
