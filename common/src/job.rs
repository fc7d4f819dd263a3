use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::AppId;

pub type JobId = i32;

/// Largo máximo de la descripción guardada para un job.
pub const MAX_DESCRIPTION_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// "appId:jobId"
    pub id: String,
    pub app_id: AppId,
    pub job_id: JobId,
    pub status: JobStatus,

    pub submission_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    pub description: Option<String>,
    pub job_group: Option<String>,

    /// Stages que abarca el job (según "Stage Infos" del JobStart)
    pub stage_ids: Vec<i32>,
    pub num_stages: u32,
    pub num_tasks: u32,

    /// -------- Métricas del job (las recalcula el engine) --------
    pub num_completed_stages: u32,
    pub num_failed_stages: u32,
    pub num_completed_tasks: u32,
    pub num_failed_tasks: u32,
    pub performance_score: Option<f64>,
}

impl Job {
    pub fn key(app_id: &str, job_id: JobId) -> String {
        format!("{}:{}", app_id, job_id)
    }

    pub fn new(app_id: &str, job_id: JobId) -> Self {
        Self {
            id: Self::key(app_id, job_id),
            app_id: app_id.to_string(),
            job_id,
            status: JobStatus::Running,
            submission_time: None,
            completion_time: None,
            duration_ms: None,
            description: None,
            job_group: None,
            stage_ids: Vec::new(),
            num_stages: 0,
            num_tasks: 0,
            num_completed_stages: 0,
            num_failed_stages: 0,
            num_completed_tasks: 0,
            num_failed_tasks: 0,
            performance_score: None,
        }
    }
}

/// Deja la descripción en una sola línea y la recorta a `MAX_DESCRIPTION_LEN`.
pub fn normalize_description(raw: &str) -> Option<String> {
    let first = raw.lines().next().unwrap_or("").trim_end();
    if first.is_empty() {
        return None;
    }

    if first.chars().count() > MAX_DESCRIPTION_LEN {
        let cut: String = first.chars().take(MAX_DESCRIPTION_LEN - 3).collect();
        Some(format!("{}...", cut))
    } else {
        Some(first.to_string())
    }
}
