//! Reporte en Markdown armado por reglas a partir de un [`DiagnosisReport`].

use std::fmt::Write;

use crate::diagnosis::{DiagnosisReport, Issue, StageDiagnosis};
use crate::format_duration;

const CRITICAL_STAGE_SCORE: f64 = 80.0;
const CRITICAL_STAGE_LIMIT: usize = 5;
const RISKY_JOB_SCORE: f64 = 90.0;
const RISKY_JOB_LIMIT: usize = 3;

pub fn health_label(score: f64) -> &'static str {
    if score < 40.0 {
        "Critical"
    } else if score < 80.0 {
        "Warning"
    } else {
        "Healthy"
    }
}

fn advice(issue: &Issue) -> String {
    match issue {
        Issue::Skew { max_task_ms, p50_ms, .. } => format!(
            "**Data skew**: slowest task took {} against a median of {}. Check the key \
             distribution of joins and aggregations; consider salting hot keys.",
            format_duration(*max_task_ms),
            format_duration(*p50_ms)
        ),
        Issue::GcPressure { ratio, .. } => format!(
            "**GC pressure**: GC time is {:.0}% of the expected stage time. Look for large \
             cached objects or give executors more heap.",
            ratio * 100.0
        ),
        Issue::TaskGcPressure { max_gc_ms, threshold_ms } => format!(
            "**Long GC pause**: one task spent {} in GC (threshold {}).",
            format_duration(*max_gc_ms),
            format_duration(*threshold_ms)
        ),
        Issue::DiskSpill { bytes, tasks } => format!(
            "**Disk spill**: {} task(s) spilled {} to disk. Increase `executor-memory` or \
             tune `spark.memory.fraction`.",
            tasks,
            format_bytes(*bytes)
        ),
    }
}

fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes.max(0))
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn write_stage(out: &mut String, stage: &StageDiagnosis) {
    let _ = writeln!(out, "### Stage {}: {}", stage.stage_id, stage.name);
    let _ = writeln!(
        out,
        "- **Score**: `{:.0}` | **Tasks**: `{}`",
        stage.score, stage.num_tasks
    );
    for issue in &stage.issues {
        let _ = writeln!(out, "- {}", advice(issue));
    }
    if let Some(caveat) = &stage.caveat {
        let _ = writeln!(out, "- _{}_", caveat);
    }
    out.push('\n');
}

/// Reporte para humanos: resumen, stages críticos, jobs de riesgo y calidad de datos.
pub fn render_markdown(report: &DiagnosisReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Rule-Based Diagnostic Report\n");
    let _ = writeln!(out, "## Overview");
    let _ = writeln!(
        out,
        "- **Health score**: `{:.0} / 100` ({})",
        report.health_score.round(),
        health_label(report.health_score)
    );
    let _ = writeln!(out, "- **Application**: `{}` (`{}`)", report.app_name, report.app_id);
    let duration = report
        .duration_ms
        .map(format_duration)
        .unwrap_or_else(|| "N/A".to_string());
    let _ = writeln!(out, "- **Duration**: `{}`", duration);
    out.push_str("\n---\n\n");

    let _ = writeln!(out, "## Stages with performance issues");
    let critical = report.worst_stages(CRITICAL_STAGE_SCORE, CRITICAL_STAGE_LIMIT);
    if critical.is_empty() {
        out.push_str("> No stage with serious performance issues.\n\n");
    } else {
        for stage in &critical {
            write_stage(&mut out, stage);
        }
    }

    let _ = writeln!(out, "## High-risk jobs");
    let risky = report.worst_jobs(RISKY_JOB_SCORE, RISKY_JOB_LIMIT);
    if risky.is_empty() {
        out.push_str("> No high-risk job.\n\n");
    } else {
        for job in risky {
            let _ = writeln!(
                out,
                "### Job {}: {}",
                job.job_id,
                job.description.as_deref().unwrap_or("Job Execution")
            );
            let _ = writeln!(
                out,
                "- **Score**: `{:.0}` | **Duration**: `{}`",
                job.score,
                job.duration_ms
                    .map(format_duration)
                    .unwrap_or_else(|| "N/A".to_string())
            );
            if critical.is_empty() {
                out.push_str("- Minor slowdown; review the stage timeline.\n\n");
            } else {
                out.push_str("- See the stage analysis above for the bottleneck.\n\n");
            }
        }
    }

    if report.duration_ms.is_none() {
        let _ = writeln!(out, "## Data quality");
        let note = report
            .data_quality_note
            .as_deref()
            .unwrap_or("Missing ApplicationEnd event.");
        let _ = writeln!(
            out,
            "{} Results are based on a partial log and may be skewed.",
            note
        );
    }

    out
}
