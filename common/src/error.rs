use thiserror::Error;

/// Errores del almacén de entidades.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock envenenado en la tabla {0}")]
    Poisoned(&'static str),

    #[error("escritura masiva rechazada: {0}")]
    BulkRejected(String),

    #[error("error de E/S en snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot inválido: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Errores de decodificación de una línea del event log.
/// Siempre recuperables: la línea se descarta y se sigue con la siguiente.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("json inválido: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errores visibles para consumidores de datos de una aplicación.
#[derive(Debug, Error)]
pub enum InsightError {
    #[error("aplicación {0} no encontrada")]
    NotFound(String),

    /// La aplicación sigue en PARSING; lleva el texto de progreso.
    #[error("aplicación todavía en proceso: {0}")]
    NotReady(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
