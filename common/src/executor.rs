use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::AppId;

pub type ExecutorId = String;

/// Totales por executor calculados desde las tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorMetrics {
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_duration: i64,
    pub total_gc_time: i64,
    pub total_input_bytes: i64,
    pub total_shuffle_read: i64,
    pub total_shuffle_write: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    /// "appId:executorId"
    pub id: String,
    pub app_id: AppId,
    pub executor_id: ExecutorId,
    pub host: String,
    pub total_cores: u32,
    pub memory: Option<i64>,
    pub add_time: Option<DateTime<Utc>>,
    pub remove_time: Option<DateTime<Utc>>,
    pub loss_reason: Option<String>,
    pub is_active: bool,
    pub metrics: ExecutorMetrics,
}

impl Executor {
    pub fn key(app_id: &str, executor_id: &str) -> String {
        format!("{}:{}", app_id, executor_id)
    }

    pub fn new(app_id: &str, executor_id: &str) -> Self {
        Self {
            id: Self::key(app_id, executor_id),
            app_id: app_id.to_string(),
            executor_id: executor_id.to_string(),
            host: "unknown".to_string(),
            total_cores: 0,
            memory: None,
            add_time: None,
            remove_time: None,
            loss_reason: None,
            is_active: true,
            metrics: ExecutorMetrics::default(),
        }
    }
}
