use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogFileStatus {
    Processing,
    Success,
    Failed,
}

/// Estado del watcher para un archivo: única fuente de verdad de
/// "esta versión exacta del archivo ya se procesó".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLogFile {
    /// ruta absoluta
    pub file_path: String,
    /// epoch millis
    pub last_modified: i64,
    pub file_size: u64,
    pub status: LogFileStatus,
    pub parsed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ParsedLogFile {
    pub fn new(file_path: &str, last_modified: i64, file_size: u64, status: LogFileStatus) -> Self {
        Self {
            file_path: file_path.to_string(),
            last_modified,
            file_size,
            status,
            parsed_at: Utc::now(),
            error: None,
        }
    }

    /// Hay que (re)parsear si cambió tamaño o mtime, si quedó en PROCESSING
    /// (intento anterior caído a mitad) o si el último intento falló.
    pub fn needs_reparse(&self, last_modified: i64, file_size: u64) -> bool {
        self.status != LogFileStatus::Success
            || self.last_modified != last_modified
            || self.file_size != file_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_reparse_detecta_cambios_y_processing() {
        let ok = ParsedLogFile::new("/x/evt_1_app", 1_000, 10, LogFileStatus::Success);
        assert!(!ok.needs_reparse(1_000, 10));
        assert!(ok.needs_reparse(1_001, 10));
        assert!(ok.needs_reparse(1_000, 11));

        let stuck = ParsedLogFile::new("/x/evt_1_app", 1_000, 10, LogFileStatus::Processing);
        assert!(stuck.needs_reparse(1_000, 10));
    }

    #[test]
    fn failed_se_reintenta_en_el_siguiente_ciclo() {
        let failed = ParsedLogFile::new("/x/evt_1_app", 1_000, 10, LogFileStatus::Failed);
        assert!(failed.needs_reparse(1_000, 10));
    }
}
