pub mod application;
pub mod config;
pub mod diagnosis;
pub mod discovery;
pub mod engine;
pub mod environment;
pub mod error;
pub mod event;
pub mod executor;
pub mod job;
pub mod ledger;
pub mod parser;
pub mod report;
pub mod results;
pub mod stage;
pub mod store;
pub mod task;
pub mod writer;

pub use application::{AppId, Application, DataQuality, ParsingStatus};
pub use config::{DiagnosisConfig, InsightConfig};
pub use diagnosis::{DiagnosisReport, Issue};
pub use error::{DecodeError, InsightError, StoreError};
pub use job::{Job, JobStatus};
pub use ledger::{LogFileStatus, ParsedLogFile};
pub use results::{DiagnosisResponse, ErrorBody, LogFileView};
pub use stage::{Stage, StageStatistics, StageStatus};
pub use store::{ensure_ready, EntityStore, MemoryStore};

/* --------- Utilidades --------- */

/// Duración legible para logs y reportes: `850ms`, `1m 5s`, `2h 0m 3s`.
pub fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        return format!("{}ms", ms.max(0));
    }
    let s = (ms / 1000) % 60;
    let m = (ms / 60_000) % 60;
    let h = ms / 3_600_000;

    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h ", h));
    }
    if m > 0 || h > 0 {
        out.push_str(&format!("{}m ", m));
    }
    out.push_str(&format!("{}s", s));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_por_magnitud() {
        assert_eq!(format_duration(850), "850ms");
        assert_eq!(format_duration(5_000), "5s");
        assert_eq!(format_duration(65_000), "1m 5s");
        assert_eq!(format_duration(7_203_000), "2h 0m 3s");
    }
}
