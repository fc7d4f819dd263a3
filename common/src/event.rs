//! Decodificación de una línea del event log de Spark a un evento tipado.
//!
//! Cada línea es un objeto JSON con un discriminador `"Event"`. Los tipos que
//! el parser entiende son variantes de [`SparkEvent`]; el resto cae en
//! [`SparkEvent::Unrecognized`] y se ignora. Todos los campos que no son
//! imprescindibles para el evento son `Option` o tienen `default`: un campo
//! obligatorio ausente hace fallar sólo esa línea.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::DecodeError;

pub type PropertyMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Event")]
pub enum SparkEvent {
    #[serde(rename = "SparkListenerLogStart")]
    LogStart(LogStart),
    #[serde(rename = "SparkListenerApplicationStart")]
    ApplicationStart(ApplicationStart),
    #[serde(rename = "SparkListenerApplicationEnd")]
    ApplicationEnd(ApplicationEnd),
    #[serde(rename = "SparkListenerEnvironmentUpdate")]
    EnvironmentUpdate(EnvironmentUpdate),
    #[serde(rename = "SparkListenerJobStart")]
    JobStart(JobStart),
    #[serde(rename = "SparkListenerJobEnd")]
    JobEnd(JobEnd),
    #[serde(rename = "SparkListenerExecutorAdded")]
    ExecutorAdded(ExecutorAdded),
    #[serde(rename = "SparkListenerExecutorRemoved")]
    ExecutorRemoved(ExecutorRemoved),
    #[serde(rename = "SparkListenerStageSubmitted")]
    StageSubmitted(StageEvent),
    #[serde(rename = "SparkListenerStageCompleted")]
    StageCompleted(StageEvent),
    #[serde(rename = "SparkListenerTaskEnd")]
    TaskEnd(TaskEnd),
    #[serde(other)]
    Unrecognized,
}

impl SparkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SparkEvent::LogStart(_) => "LogStart",
            SparkEvent::ApplicationStart(_) => "ApplicationStart",
            SparkEvent::ApplicationEnd(_) => "ApplicationEnd",
            SparkEvent::EnvironmentUpdate(_) => "EnvironmentUpdate",
            SparkEvent::JobStart(_) => "JobStart",
            SparkEvent::JobEnd(_) => "JobEnd",
            SparkEvent::ExecutorAdded(_) => "ExecutorAdded",
            SparkEvent::ExecutorRemoved(_) => "ExecutorRemoved",
            SparkEvent::StageSubmitted(_) => "StageSubmitted",
            SparkEvent::StageCompleted(_) => "StageCompleted",
            SparkEvent::TaskEnd(_) => "TaskEnd",
            SparkEvent::Unrecognized => "Unrecognized",
        }
    }
}

/// Decodifica una línea cruda. Líneas vacías devuelven `Ok(None)`.
pub fn decode_line(line: &[u8]) -> Result<Option<SparkEvent>, DecodeError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let event = serde_json::from_slice::<SparkEvent>(line)?;
    Ok(Some(event))
}

/* --------- Payloads --------- */

#[derive(Debug, Clone, Deserialize)]
pub struct LogStart {
    #[serde(rename = "Spark Version")]
    pub spark_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationStart {
    #[serde(rename = "App Name")]
    pub app_name: Option<String>,
    #[serde(rename = "App ID")]
    pub app_id: Option<String>,
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<i64>,
    #[serde(rename = "User")]
    pub user: Option<String>,
    #[serde(rename = "Spark Version")]
    pub spark_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationEnd {
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentUpdate {
    #[serde(rename = "JVM Information", default)]
    pub jvm_information: Option<PropertyMap>,
    #[serde(rename = "Spark Properties", default)]
    pub spark_properties: Option<PropertyMap>,
    #[serde(rename = "Hadoop Properties", default)]
    pub hadoop_properties: Option<PropertyMap>,
    #[serde(rename = "System Properties", default)]
    pub system_properties: Option<PropertyMap>,
    #[serde(rename = "Metrics Properties", default)]
    pub metrics_properties: Option<PropertyMap>,
    #[serde(rename = "Classpath Entries", default)]
    pub classpath_entries: Option<PropertyMap>,
}

impl EnvironmentUpdate {
    pub fn spark_property(&self, key: &str) -> Option<String> {
        self.spark_properties
            .as_ref()
            .and_then(|props| props.get(key))
            .map(value_as_text)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStart {
    #[serde(rename = "Job ID")]
    pub job_id: i32,
    #[serde(rename = "Submission Time")]
    pub submission_time: Option<i64>,
    #[serde(rename = "Stage Infos", default)]
    pub stage_infos: Vec<StageInfo>,
    #[serde(rename = "Stage IDs", default)]
    pub stage_ids: Vec<i32>,
    #[serde(rename = "Properties", default)]
    pub properties: Option<PropertyMap>,
}

impl JobStart {
    pub fn property(&self, key: &str) -> Option<String> {
        self.properties
            .as_ref()
            .and_then(|props| props.get(key))
            .map(value_as_text)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobResult {
    #[serde(rename = "Result")]
    pub result: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEnd {
    #[serde(rename = "Job ID")]
    pub job_id: i32,
    #[serde(rename = "Completion Time")]
    pub completion_time: Option<i64>,
    #[serde(rename = "Job Result")]
    pub job_result: Option<JobResult>,
}

impl JobEnd {
    pub fn succeeded(&self) -> bool {
        self.job_result
            .as_ref()
            .map(|r| r.result == "JobSucceeded")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorInfo {
    #[serde(rename = "Host")]
    pub host: Option<String>,
    #[serde(rename = "Total Cores")]
    pub total_cores: Option<u32>,
    #[serde(rename = "Memory")]
    pub memory: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorAdded {
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<i64>,
    #[serde(rename = "Executor ID")]
    pub executor_id: String,
    #[serde(rename = "Executor Info")]
    pub executor_info: Option<ExecutorInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorRemoved {
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<i64>,
    #[serde(rename = "Executor ID")]
    pub executor_id: String,
    #[serde(rename = "Removed Reason")]
    pub removed_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageInfo {
    #[serde(rename = "Stage ID")]
    pub stage_id: i32,
    #[serde(rename = "Stage Attempt ID", default)]
    pub attempt_id: i32,
    #[serde(rename = "Stage Name")]
    pub stage_name: Option<String>,
    #[serde(rename = "Number of Tasks")]
    pub num_tasks: Option<u32>,
    #[serde(rename = "Parent IDs", default)]
    pub parent_ids: Vec<i32>,
    #[serde(rename = "RDD Info")]
    pub rdd_info: Option<Value>,
    #[serde(rename = "Submission Time")]
    pub submission_time: Option<i64>,
    #[serde(rename = "Completion Time")]
    pub completion_time: Option<i64>,
    #[serde(rename = "Failure Reason")]
    pub failure_reason: Option<String>,
}

/// StageSubmitted y StageCompleted comparten forma.
#[derive(Debug, Clone, Deserialize)]
pub struct StageEvent {
    #[serde(rename = "Stage Info")]
    pub stage_info: StageInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEndReason {
    #[serde(rename = "Reason")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskInfo {
    #[serde(rename = "Task ID")]
    pub task_id: i64,
    #[serde(rename = "Index")]
    pub index: Option<i32>,
    #[serde(rename = "Launch Time")]
    pub launch_time: Option<i64>,
    #[serde(rename = "Finish Time")]
    pub finish_time: Option<i64>,
    #[serde(rename = "Duration")]
    pub duration: Option<i64>,
    #[serde(rename = "Executor ID")]
    pub executor_id: Option<String>,
    #[serde(rename = "Host")]
    pub host: Option<String>,
    #[serde(rename = "Locality")]
    pub locality: Option<String>,
    #[serde(rename = "Speculative")]
    pub speculative: Option<bool>,
    #[serde(rename = "Getting Result Time")]
    pub getting_result_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputMetrics {
    #[serde(rename = "Bytes Read")]
    pub bytes_read: Option<i64>,
    #[serde(rename = "Records Read")]
    pub records_read: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputMetrics {
    #[serde(rename = "Bytes Written")]
    pub bytes_written: Option<i64>,
    #[serde(rename = "Records Written")]
    pub records_written: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShuffleReadMetrics {
    #[serde(rename = "Remote Bytes Read")]
    pub remote_bytes_read: Option<i64>,
    #[serde(rename = "Local Bytes Read")]
    pub local_bytes_read: Option<i64>,
    #[serde(rename = "Total Records Read")]
    pub total_records_read: Option<i64>,
    #[serde(rename = "Fetch Wait Time")]
    pub fetch_wait_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShuffleWriteMetrics {
    #[serde(rename = "Shuffle Bytes Written")]
    pub bytes_written: Option<i64>,
    #[serde(rename = "Shuffle Records Written")]
    pub records_written: Option<i64>,
    #[serde(rename = "Shuffle Write Time")]
    pub write_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskMetrics {
    #[serde(rename = "Executor Deserialize Time")]
    pub executor_deserialize_time: Option<i64>,
    #[serde(rename = "Executor Run Time")]
    pub executor_run_time: Option<i64>,
    #[serde(rename = "Executor CPU Time")]
    pub executor_cpu_time: Option<i64>,
    #[serde(rename = "Result Serialization Time")]
    pub result_serialization_time: Option<i64>,
    #[serde(rename = "JVM GC Time")]
    pub jvm_gc_time: Option<i64>,
    #[serde(rename = "Peak Execution Memory")]
    pub peak_execution_memory: Option<i64>,
    #[serde(rename = "Memory Bytes Spilled")]
    pub memory_bytes_spilled: Option<i64>,
    #[serde(rename = "Disk Bytes Spilled")]
    pub disk_bytes_spilled: Option<i64>,
    #[serde(rename = "Input Metrics")]
    pub input: Option<InputMetrics>,
    #[serde(rename = "Output Metrics")]
    pub output: Option<OutputMetrics>,
    #[serde(rename = "Shuffle Read Metrics")]
    pub shuffle_read: Option<ShuffleReadMetrics>,
    #[serde(rename = "Shuffle Write Metrics")]
    pub shuffle_write: Option<ShuffleWriteMetrics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEnd {
    #[serde(rename = "Stage ID")]
    pub stage_id: Option<i32>,
    #[serde(rename = "Stage Attempt ID")]
    pub stage_attempt_id: Option<i32>,
    #[serde(rename = "Task End Reason")]
    pub end_reason: Option<TaskEndReason>,
    #[serde(rename = "Task Info")]
    pub task_info: Option<TaskInfo>,
    #[serde(rename = "Task Metrics")]
    pub task_metrics: Option<TaskMetrics>,
}

/// Texto de un valor de propiedad: los strings sin comillas, el resto como JSON.
pub fn value_as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_line_reconoce_application_start() {
        let line = br#"{"Event":"SparkListenerApplicationStart","App Name":"etl","App ID":"app-1","Timestamp":1700000000000,"User":"ana"}"#;
        match decode_line(line).unwrap() {
            Some(SparkEvent::ApplicationStart(ev)) => {
                assert_eq!(ev.app_id.as_deref(), Some("app-1"));
                assert_eq!(ev.app_name.as_deref(), Some("etl"));
                assert_eq!(ev.timestamp, Some(1_700_000_000_000));
            }
            other => panic!("evento inesperado: {:?}", other),
        }
    }

    #[test]
    fn decode_line_eventos_desconocidos_son_unrecognized() {
        let line = br#"{"Event":"org.apache.spark.sql.execution.ui.SparkListenerSQLExecutionStart","executionId":1}"#;
        assert!(matches!(
            decode_line(line).unwrap(),
            Some(SparkEvent::Unrecognized)
        ));
    }

    #[test]
    fn decode_line_linea_vacia_es_none() {
        assert!(decode_line(b"   \n").unwrap().is_none());
    }

    #[test]
    fn decode_line_json_truncado_es_error() {
        let line = br#"{"Event":"SparkListenerTaskEnd","Stage ID":1,"Task Info":{"Task"#;
        assert!(decode_line(line).is_err());
    }

    #[test]
    fn decode_line_campo_obligatorio_faltante_es_error() {
        // JobStart sin "Job ID"
        let line = br#"{"Event":"SparkListenerJobStart","Submission Time":1}"#;
        assert!(decode_line(line).is_err());
    }

    #[test]
    fn decode_line_task_end_con_metricas_parciales() {
        let line = br#"{"Event":"SparkListenerTaskEnd","Stage ID":2,"Stage Attempt ID":0,
            "Task End Reason":{"Reason":"Success"},
            "Task Info":{"Task ID":7,"Launch Time":1000,"Finish Time":1500},
            "Task Metrics":{"JVM GC Time":30,"Shuffle Read Metrics":{"Remote Bytes Read":10}}}"#;
        let Some(SparkEvent::TaskEnd(ev)) = decode_line(line).unwrap() else {
            panic!("se esperaba TaskEnd");
        };
        let metrics = ev.task_metrics.unwrap();
        assert_eq!(metrics.jvm_gc_time, Some(30));
        assert!(metrics.disk_bytes_spilled.is_none());
        assert_eq!(metrics.shuffle_read.unwrap().remote_bytes_read, Some(10));
    }

    #[test]
    fn environment_update_lee_propiedades_de_spark() {
        let line = br#"{"Event":"SparkListenerEnvironmentUpdate","Spark Properties":{"spark.app.id":"app-9","spark.executor.cores":4}}"#;
        let Some(SparkEvent::EnvironmentUpdate(ev)) = decode_line(line).unwrap() else {
            panic!("se esperaba EnvironmentUpdate");
        };
        assert_eq!(ev.spark_property("spark.app.id").as_deref(), Some("app-9"));
        assert_eq!(ev.spark_property("spark.executor.cores").as_deref(), Some("4"));
        assert!(ev.hadoop_properties.is_none());
    }
}
