use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AppId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParsingStatus {
    Parsing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQuality {
    Good,
    Incomplete,
}

/// Nota que se deja cuando el log no trae ApplicationEnd.
pub const MISSING_APP_END_NOTE: &str = "Missing ApplicationEnd event. Log might be truncated.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub app_id: AppId,
    pub name: String,
    pub user: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    /// Versión de Spark; `None` mientras no se conozca.
    pub spark_version: Option<String>,

    pub parsing_status: ParsingStatus,
    pub parsing_progress: Option<String>,
    pub data_quality: Option<DataQuality>,
    pub data_quality_note: Option<String>,

    /// Promedio de los scores de los jobs (lo escribe el engine)
    pub health_score: Option<f64>,
}

impl Application {
    pub fn new(app_id: impl Into<AppId>) -> Self {
        Self {
            app_id: app_id.into(),
            name: "Unknown App".to_string(),
            user: "unknown".to_string(),
            start_time: None,
            end_time: None,
            duration_ms: None,
            spark_version: None,
            parsing_status: ParsingStatus::Parsing,
            parsing_progress: None,
            data_quality: None,
            data_quality_note: None,
            health_score: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.parsing_status == ParsingStatus::Ready
    }

    /// Sólo completa la versión si todavía es desconocida: nunca la pisa.
    pub fn fill_version(&mut self, version: Option<&str>) -> bool {
        match (self.spark_version.as_deref(), version) {
            (None, Some(v)) | (Some("unknown"), Some(v)) if v != "unknown" => {
                self.spark_version = Some(v.to_string());
                true
            }
            _ => false,
        }
    }
}

/// Convierte epoch millis de Spark a `DateTime<Utc>`; valores <= 0 son "sin dato".
pub fn millis_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.filter(|v| *v > 0)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_version_no_pisa_una_version_conocida() {
        let mut app = Application::new("app-1");
        assert!(app.fill_version(Some("3.5.0")));
        assert!(!app.fill_version(Some("2.4.0")));
        assert_eq!(app.spark_version.as_deref(), Some("3.5.0"));
    }

    #[test]
    fn fill_version_reemplaza_unknown() {
        let mut app = Application::new("app-1");
        app.spark_version = Some("unknown".to_string());
        assert!(app.fill_version(Some("3.4.1")));
        assert_eq!(app.spark_version.as_deref(), Some("3.4.1"));
    }

    #[test]
    fn millis_to_datetime_ignora_no_positivos() {
        assert!(millis_to_datetime(Some(0)).is_none());
        assert!(millis_to_datetime(None).is_none());
        let dt = millis_to_datetime(Some(1_700_000_000_000)).unwrap();
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_000);
    }
}
