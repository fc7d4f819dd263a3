use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Prefijos reconocidos por defecto para archivos de event log.
pub const DEFAULT_FILE_PREFIXES: [&str; 6] =
    ["event", "evt", "events_", "app-", "application_", "eventlog"];

const DEFAULT_EVENT_LOG_PATH: &str = "./eventlogs";
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;
const DEFAULT_PARSE_WORKERS: usize = 10;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 2000;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Configuración de ingesta (watcher + parser + writer).
#[derive(Debug, Clone)]
pub struct InsightConfig {
    pub event_log_path: PathBuf,
    pub scheduler_enabled: bool,
    pub scan_interval: Duration,
    pub parse_workers: usize,
    pub batch_size: usize,
    pub progress_interval: Duration,
    /// Si está, el store se carga de y se guarda en este archivo JSON.
    pub snapshot_path: Option<PathBuf>,
    pub listen_addr: String,
    pub file_prefixes: Vec<String>,
    pub diagnosis: DiagnosisConfig,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            event_log_path: PathBuf::from(DEFAULT_EVENT_LOG_PATH),
            scheduler_enabled: true,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            parse_workers: DEFAULT_PARSE_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            snapshot_path: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            file_prefixes: DEFAULT_FILE_PREFIXES.iter().map(|p| p.to_string()).collect(),
            diagnosis: DiagnosisConfig::default(),
        }
    }
}

impl InsightConfig {
    /// Lee INSIGHT_* del entorno; lo que falte o no parsee queda en su default.
    pub fn from_env() -> Self {
        let prefixes = env::var("INSIGHT_FILE_PREFIXES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_FILE_PREFIXES.iter().map(|p| p.to_string()).collect());

        Self {
            event_log_path: env::var("INSIGHT_EVENT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_EVENT_LOG_PATH)),
            scheduler_enabled: env_or("INSIGHT_SCHEDULER_ENABLED", true),
            scan_interval: Duration::from_secs(
                env_or("INSIGHT_SCAN_INTERVAL_SECS", DEFAULT_SCAN_INTERVAL_SECS).max(1),
            ),
            parse_workers: env_or("INSIGHT_PARSE_WORKERS", DEFAULT_PARSE_WORKERS).max(1),
            batch_size: env_or("INSIGHT_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            progress_interval: Duration::from_millis(env_or(
                "INSIGHT_PROGRESS_INTERVAL_MS",
                DEFAULT_PROGRESS_INTERVAL_MS,
            )),
            snapshot_path: env::var("INSIGHT_SNAPSHOT_PATH").ok().map(PathBuf::from),
            listen_addr: env::var("INSIGHT_LISTEN_ADDR")
                .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string()),
            file_prefixes: prefixes,
            diagnosis: DiagnosisConfig::from_env(),
        }
    }
}

/// Umbrales de las reglas de diagnóstico.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisConfig {
    /// Debajo de esto el max de un stage no cuenta como skew aunque la razón lo sea.
    pub skew_min_duration_ms: i64,
    pub gc_min_duration_ms: i64,
    /// max > skew_ratio * p50
    pub skew_ratio: f64,
    /// Criterio alternativo: max - p50 > gap
    pub skew_min_gap_ms: Option<i64>,
    /// gcTimeSum / (p50 * numTasks)
    pub gc_ratio_threshold: f64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            skew_min_duration_ms: 1000,
            gc_min_duration_ms: 800,
            skew_ratio: 2.0,
            skew_min_gap_ms: None,
            gc_ratio_threshold: 0.10,
        }
    }
}

impl DiagnosisConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            skew_min_duration_ms: env_or("INSIGHT_SKEW_MIN_DURATION_MS", d.skew_min_duration_ms),
            gc_min_duration_ms: env_or("INSIGHT_GC_MIN_DURATION_MS", d.gc_min_duration_ms),
            skew_ratio: env_or("INSIGHT_SKEW_RATIO", d.skew_ratio),
            skew_min_gap_ms: env_opt("INSIGHT_SKEW_MIN_GAP_MS"),
            gc_ratio_threshold: env_or("INSIGHT_GC_RATIO_THRESHOLD", d.gc_ratio_threshold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_coinciden_con_los_documentados() {
        let cfg = InsightConfig::default();
        assert_eq!(cfg.scan_interval, Duration::from_secs(10));
        assert_eq!(cfg.parse_workers, 10);
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.progress_interval, Duration::from_secs(2));
        assert_eq!(cfg.file_prefixes.len(), 6);
        assert_eq!(cfg.diagnosis.skew_min_duration_ms, 1000);
        assert_eq!(cfg.diagnosis.gc_min_duration_ms, 800);
        assert!(cfg.diagnosis.skew_min_gap_ms.is_none());
    }

    #[test]
    fn diagnosis_from_env_respeta_env_vars() {
        env::set_var("INSIGHT_SKEW_MIN_DURATION_MS", "500");
        env::set_var("INSIGHT_SKEW_MIN_GAP_MS", "3000");
        env::set_var("INSIGHT_SKEW_RATIO", "no-es-numero");
        let cfg = DiagnosisConfig::from_env();
        env::remove_var("INSIGHT_SKEW_MIN_DURATION_MS");
        env::remove_var("INSIGHT_SKEW_MIN_GAP_MS");
        env::remove_var("INSIGHT_SKEW_RATIO");

        assert_eq!(cfg.skew_min_duration_ms, 500);
        assert_eq!(cfg.skew_min_gap_ms, Some(3000));
        assert_eq!(cfg.skew_ratio, 2.0);
    }
}
