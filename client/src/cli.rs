use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::discovery::{group_files, scan};
use common::parser::TraceParser;
use common::report::{health_label, render_markdown};
use common::writer::BatchWriter;
use common::{
    format_duration, Application, DiagnosisReport, DiagnosisResponse, EntityStore, ErrorBody,
    InsightConfig, LogFileView, MemoryStore,
};
use reqwest::{Client, StatusCode};
use std::{env, path::PathBuf, sync::Arc};
use tracing::{error, info};

/// Igual que en el master:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para consultar el master o analizar event logs localmente")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lista las aplicaciones conocidas por el master
    Apps,
    /// Estado de parseo y calidad de una aplicación
    Status {
        #[arg(value_name = "APP_ID")]
        id: String,
    },
    /// Reporte de diagnóstico de una aplicación
    Report {
        #[arg(value_name = "APP_ID")]
        id: String,

        /// Imprime el reporte en JSON en vez de Markdown
        #[arg(long)]
        json: bool,
    },
    /// Archivos que vio el watcher y su estado
    Files,
    /// Analiza un directorio de event logs sin master y muestra el reporte
    Analyze {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Sólo esta aplicación
        #[arg(long)]
        app: Option<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Apps => {
            let url = format!("{}/api/v1/apps", base_url);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                println!("Error listando aplicaciones (status {})", resp.status());
                return Ok(());
            }
            let apps: Vec<Application> = resp.json().await?;
            if apps.is_empty() {
                println!("No hay aplicaciones todavía");
            }
            for app in &apps {
                println!("{}", app_line(app));
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/apps/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let app: Application = resp.json().await?;
                print_status(&app);
            } else {
                println!("Error: aplicación no encontrada (status {})", resp.status());
            }
        }

        Commands::Report { id, json } => {
            let url = format!("{}/api/v1/apps/{}/diagnosis", base_url, id);
            let resp = client.get(&url).send().await?;
            match resp.status() {
                StatusCode::OK => {
                    let body: DiagnosisResponse = resp.json().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&body.report)?);
                    } else {
                        println!("{}", body.markdown);
                    }
                }
                StatusCode::CONFLICT => {
                    let body: ErrorBody = resp.json().await?;
                    println!(
                        "La aplicación {} todavía se está procesando: {}",
                        id,
                        body.progress.unwrap_or_else(|| "Parsing".to_string())
                    );
                }
                other => println!("Error: no hay reporte para {} (status {})", id, other),
            }
        }

        Commands::Files => {
            let url = format!("{}/api/v1/files", base_url);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                println!("Error listando archivos (status {})", resp.status());
                return Ok(());
            }
            let files: Vec<LogFileView> = resp.json().await?;
            for f in &files {
                println!("{}", file_line(f));
            }
        }

        Commands::Analyze { dir, app } => {
            let mut config = InsightConfig::from_env();
            config.event_log_path = dir;
            let reports = tokio::task::spawn_blocking(move || analyze_dir(&config))
                .await
                .context("análisis abortado")??;

            let mut shown = 0;
            for report in reports
                .iter()
                .filter(|r| app.as_deref().map_or(true, |a| a == r.app_id))
            {
                println!("{}", render_markdown(report));
                shown += 1;
            }
            if shown == 0 {
                println!("No se encontraron aplicaciones para analizar");
            }
        }
    }

    Ok(())
}

/// Ingesta completa de un directorio en un store propio, sin watcher ni ledger.
fn analyze_dir(config: &InsightConfig) -> Result<Vec<DiagnosisReport>> {
    let files = scan(&config.event_log_path, &config.file_prefixes)?;
    let groups = group_files(files);
    info!(
        "{} grupos encontrados en {}",
        groups.len(),
        config.event_log_path.display()
    );

    let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
    let parser = TraceParser::new(store.clone(), config);

    let mut reports = Vec::new();
    for group in &groups {
        match parser.parse_group(group, BatchWriter::inline(store.clone())) {
            Ok(Some(report)) => reports.push(report),
            Ok(None) => {}
            Err(e) => error!("no se pudo analizar {}: {e:#}", group.label()),
        }
    }
    Ok(reports)
}

fn app_line(app: &Application) -> String {
    let health = app
        .health_score
        .map(|s| format!("{:.0} ({})", s, health_label(s)))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:?}  {}  salud={}",
        app.app_id, app.parsing_status, app.name, health
    )
}

fn print_status(app: &Application) {
    println!("Aplicación:");
    println!("  id: {}", app.app_id);
    println!("  nombre: {}", app.name);
    println!("  usuario: {}", app.user);
    println!("  estado: {:?}", app.parsing_status);
    if let Some(progress) = &app.parsing_progress {
        println!("  progreso: {}", progress);
    }
    if let Some(version) = &app.spark_version {
        println!("  spark: {}", version);
    }
    if let Some(ms) = app.duration_ms {
        println!("  duración: {}", format_duration(ms));
    }
    if let Some(quality) = app.data_quality {
        println!("  calidad de datos: {:?}", quality);
    }
    if let Some(note) = &app.data_quality_note {
        println!("  nota: {}", note);
    }
    if let Some(score) = app.health_score {
        println!("  salud: {:.0} ({})", score, health_label(score));
    }
}

fn file_line(f: &LogFileView) -> String {
    let mut line = format!("{:?}  {}  {} bytes", f.row.status, f.row.file_path, f.row.file_size);
    if f.in_flight {
        line.push_str("  [en proceso]");
    }
    if let Some(err) = &f.row.error {
        line.push_str(&format!("  error: {}", err));
    }
    line
}
