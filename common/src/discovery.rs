//! Descubrimiento de event logs: qué archivos cuentan, a qué aplicación
//! pertenecen y en qué orden se leen.

use anyhow::{Context, Result};
use glob::glob;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tracing::warn;

/// Prefijos de logs "rolling": evt_<n>_<appId>
const ROLLING_PREFIXES: [&str; 2] = ["event", "evt"];

static APP_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(spark-[A-Za-z0-9\-]+|app-\d+-\d+|application_\d+_\d+)")
        .expect("regex de app id")
});

static INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_](\d+)[-_]").expect("regex de índice"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
    Gzip,
}

impl Compression {
    pub fn from_name(name: &str) -> Self {
        if name.ends_with(".zst") || name.ends_with(".zstd") {
            Compression::Zstd
        } else if name.ends_with(".gz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

/// Nombre sin el sufijo de compresión.
pub fn strip_compression_suffix(name: &str) -> &str {
    [".zstd", ".zst", ".gz"]
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name)
}

/// Archivo no oculto cuyo nombre empieza con algún prefijo configurado.
pub fn is_event_log_name(name: &str, prefixes: &[String]) -> bool {
    !name.starts_with('.') && prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

/// App id a partir del nombre del archivo, si se puede.
///
/// Primero la forma rolling (`evt_<n>_<appId>`), luego un regex con las
/// formas conocidas de id de aplicación.
pub fn infer_app_id(name: &str) -> Option<String> {
    let base = strip_compression_suffix(name);

    if ROLLING_PREFIXES.iter().any(|p| base.starts_with(p)) {
        let parts: Vec<&str> = base.splitn(3, '_').collect();
        if parts.len() == 3 && !parts[2].is_empty() {
            return Some(parts[2].to_string());
        }
    }

    APP_ID_RE.find(base).map(|m| m.as_str().to_string())
}

/// Índice numérico de un archivo rolling (0 si no tiene).
pub fn file_index(name: &str) -> u64 {
    INDEX_RE
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub name: String,
    /// epoch millis
    pub last_modified: i64,
    pub size: u64,
    pub index: u64,
    pub compression: Compression,
}

impl LogFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)
            .with_context(|| format!("no se pudo leer metadata de {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        Ok(Self {
            index: file_index(&name),
            compression: Compression::from_name(&name),
            path,
            name,
            last_modified,
            size: meta.len(),
        })
    }

    /// Ruta absoluta como texto: clave del ledger.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

/// Unidad de trabajo: los archivos de una aplicación (en orden) o un archivo suelto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogGroup {
    /// `None` para archivos que no se pudieron agrupar.
    pub app_id: Option<String>,
    pub files: Vec<LogFile>,
}

impl LogGroup {
    /// Nombre para logs.
    pub fn label(&self) -> String {
        match &self.app_id {
            Some(id) => id.clone(),
            None => self
                .files
                .first()
                .map(|f| f.name.clone())
                .unwrap_or_default(),
        }
    }
}

/// Recorre `root` recursivamente y devuelve los event logs reconocidos.
pub fn scan(root: &Path, prefixes: &[String]) -> Result<Vec<LogFile>> {
    if !root.is_dir() {
        warn!("directorio de event logs {} no existe", root.display());
        return Ok(Vec::new());
    }

    let pattern = format!("{}/**/*", root.display());
    let mut files = Vec::new();

    for entry in glob(&pattern).with_context(|| format!("patrón inválido: {pattern}"))? {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                warn!("entrada ilegible durante el escaneo: {e}");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !is_event_log_name(&name, prefixes) {
            continue;
        }
        match LogFile::from_path(&path) {
            Ok(f) => files.push(f),
            Err(e) => warn!("{e:#}"),
        }
    }

    Ok(files)
}

/// Agrupa por app id y ordena cada grupo por (índice, nombre).
pub fn group_files(files: Vec<LogFile>) -> Vec<LogGroup> {
    let mut by_app: BTreeMap<String, Vec<LogFile>> = BTreeMap::new();
    let mut standalone = Vec::new();

    for f in files {
        match infer_app_id(&f.name) {
            Some(app_id) => by_app.entry(app_id).or_default().push(f),
            None => standalone.push(f),
        }
    }

    let mut groups: Vec<LogGroup> = by_app
        .into_iter()
        .map(|(app_id, mut files)| {
            files.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
            LogGroup {
                app_id: Some(app_id),
                files,
            }
        })
        .collect();

    standalone.sort_by(|a, b| a.name.cmp(&b.name));
    groups.extend(standalone.into_iter().map(|f| LogGroup {
        app_id: None,
        files: vec![f],
    }));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FILE_PREFIXES;

    fn prefixes() -> Vec<String> {
        DEFAULT_FILE_PREFIXES.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn infer_app_id_forma_rolling() {
        assert_eq!(infer_app_id("evt_2_app-123").as_deref(), Some("app-123"));
        assert_eq!(infer_app_id("events_1_app-123.zst").as_deref(), Some("app-123"));
        assert_eq!(
            infer_app_id("eventlog_v2_spark-abc_def").as_deref(),
            Some("spark-abc_def")
        );
    }

    #[test]
    fn infer_app_id_cae_al_regex() {
        assert_eq!(
            infer_app_id("app-20231010123456-0001").as_deref(),
            Some("app-20231010123456-0001")
        );
        assert_eq!(
            infer_app_id("application_1700000000000_0042.gz").as_deref(),
            Some("application_1700000000000_0042")
        );
        assert_eq!(infer_app_id("eventlog-spark-7f3a").as_deref(), Some("spark-7f3a"));
        assert!(infer_app_id("eventlog").is_none());
    }

    #[test]
    fn file_index_usa_el_primer_numero_entre_separadores() {
        assert_eq!(file_index("evt_3_app-1"), 3);
        assert_eq!(file_index("events_12_app-1.zst"), 12);
        assert_eq!(file_index("eventlog"), 0);
    }

    #[test]
    fn nombres_ocultos_o_con_otro_prefijo_no_cuentan() {
        let p = prefixes();
        assert!(is_event_log_name("evt_1_app-1", &p));
        assert!(is_event_log_name("application_1_2", &p));
        assert!(!is_event_log_name(".evt_1_app-1", &p));
        assert!(!is_event_log_name("README.md", &p));
    }

    #[test]
    fn compresion_por_sufijo() {
        assert_eq!(Compression::from_name("evt_1_a.zst"), Compression::Zstd);
        assert_eq!(Compression::from_name("evt_1_a.zstd"), Compression::Zstd);
        assert_eq!(Compression::from_name("evt_1_a.gz"), Compression::Gzip);
        assert_eq!(Compression::from_name("evt_1_a"), Compression::None);
        assert_eq!(strip_compression_suffix("evt_1_a.zstd"), "evt_1_a");
    }

    #[test]
    fn scan_y_group_ordenan_por_indice() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("nested");
        fs::create_dir_all(&sub).unwrap();
        for name in ["evt_10_app-1", "evt_2_app-1", "evt_1_app-1"] {
            fs::write(dir.path().join(name), "{}\n").unwrap();
        }
        fs::write(sub.join("eventlog"), "{}\n").unwrap();
        fs::write(dir.path().join(".evt_3_app-1"), "{}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = scan(dir.path(), &prefixes()).unwrap();
        assert_eq!(files.len(), 4);

        let groups = group_files(files);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].app_id.as_deref(), Some("app-1"));
        let names: Vec<&str> = groups[0].files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["evt_1_app-1", "evt_2_app-1", "evt_10_app-1"]);
        assert!(groups[1].app_id.is_none());
        assert_eq!(groups[1].files[0].name, "eventlog");
    }

    #[test]
    fn scan_de_directorio_inexistente_es_vacio() {
        let files = scan(Path::new("/no/existe/para/nada"), &prefixes()).unwrap();
        assert!(files.is_empty());
    }
}
