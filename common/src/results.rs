use serde::{Deserialize, Serialize};

use crate::diagnosis::DiagnosisReport;
use crate::ledger::ParsedLogFile;

/// Respuesta de `/api/v1/apps/:id/diagnosis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisResponse {
    pub report: DiagnosisReport,
    /// El mismo reporte en Markdown
    pub markdown: String,
}

/// Fila del ledger del watcher tal como la ve un consumidor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileView {
    #[serde(flatten)]
    pub row: ParsedLogFile,
    /// Algún worker lo está parseando ahora
    pub in_flight: bool,
}

/// Cuerpo de los errores HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Texto de progreso cuando la aplicación sigue en PARSING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}
