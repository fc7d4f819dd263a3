use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use common::engine;
use common::report::render_markdown;
use common::{
    ensure_ready, Application, DiagnosisResponse, ErrorBody, InsightError, LogFileView, Stage,
    StoreError,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/apps", get(list_apps))
        .route("/api/v1/apps/:id", get(get_app))
        .route("/api/v1/apps/:id/stages", get(get_stages))
        .route("/api/v1/apps/:id/diagnosis", get(get_diagnosis))
        .route("/api/v1/files", get(list_files))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/* ---------------- errores ---------------- */

fn insight_error(e: InsightError) -> ApiError {
    match e {
        InsightError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("aplicación {} no encontrada", id),
                progress: None,
            }),
        ),
        InsightError::NotReady(progress) => {
            debug!("consulta rechazada, app en proceso: {}", progress);
            (
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: "la aplicación todavía se está procesando".to_string(),
                    progress: Some(progress),
                }),
            )
        }
        InsightError::Store(e) => store_error(e),
    }
}

fn store_error(e: StoreError) -> ApiError {
    error!("error del store atendiendo una consulta: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: e.to_string(),
            progress: None,
        }),
    )
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Todas las aplicaciones, en cualquier estado
async fn list_apps(State(state): State<AppState>) -> ApiResult<Vec<Application>> {
    let apps = state.store.list_applications().map_err(store_error)?;
    Ok(Json(apps))
}

// Estado de una aplicación; no pasa por el gate para que se vea el progreso
async fn get_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Application> {
    match state.store.get_application(&id).map_err(store_error)? {
        Some(app) => Ok(Json(app)),
        None => Err(insight_error(InsightError::NotFound(id))),
    }
}

async fn get_stages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Stage>> {
    ensure_ready(state.store.as_ref(), &id).map_err(insight_error)?;
    let mut stages = state.store.stages_for_app(&id).map_err(store_error)?;
    stages.sort_by_key(|s| (s.stage_id, s.attempt_id));
    Ok(Json(stages))
}

async fn get_diagnosis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DiagnosisResponse> {
    ensure_ready(state.store.as_ref(), &id).map_err(insight_error)?;
    let report = engine::load_report(state.store.as_ref(), &id).map_err(insight_error)?;
    let markdown = render_markdown(&report);
    Ok(Json(DiagnosisResponse { report, markdown }))
}

// Ledger del watcher
async fn list_files(State(state): State<AppState>) -> ApiResult<Vec<LogFileView>> {
    let rows = state.store.parsed_logs().map_err(store_error)?;
    let files = rows
        .into_iter()
        .map(|row| LogFileView {
            in_flight: state.is_in_flight(&row.file_path),
            row,
        })
        .collect();
    Ok(Json(files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::{
        EntityStore, InsightConfig, LogFileStatus, MemoryStore, ParsedLogFile, ParsingStatus,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state_with(apps: Vec<Application>) -> AppState {
        let store = MemoryStore::new();
        for app in apps {
            store.upsert_application(app).unwrap();
        }
        AppState::new(Arc::new(store), InsightConfig::default())
    }

    fn app(id: &str, status: ParsingStatus) -> Application {
        let mut a = Application::new(id);
        a.parsing_status = status;
        if status == ParsingStatus::Parsing {
            a.parsing_progress = Some("Processing file 1/2 (Lines processed: 10)".into());
        }
        a
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let res = build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let res = build_router(state_with(vec![]))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn app_en_parsing_se_ve_pero_no_se_diagnostica() {
        let st = state_with(vec![app("app-1", ParsingStatus::Parsing)]);

        let (status, body) = get_json(st.clone(), "/api/v1/apps/app-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["parsing_status"], "PARSING");

        let (status, body) = get_json(st.clone(), "/api/v1/apps/app-1/diagnosis").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["progress"].as_str().unwrap().starts_with("Processing file 1/2"));

        let (status, _) = get_json(st, "/api/v1/apps/app-1/stages").await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn app_inexistente_es_404() {
        let st = state_with(vec![]);
        let (status, _) = get_json(st.clone(), "/api/v1/apps/nada").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(st, "/api/v1/apps/nada/diagnosis").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn diagnosis_de_app_lista_trae_markdown() {
        let mut ready = app("app-2", ParsingStatus::Ready);
        ready.name = "etl".into();
        ready.health_score = Some(100.0);
        let st = state_with(vec![ready]);

        let (status, body) = get_json(st, "/api/v1/apps/app-2/diagnosis").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["app_id"], "app-2");
        assert!(body["markdown"]
            .as_str()
            .unwrap()
            .contains("# Rule-Based Diagnostic Report"));
    }

    #[tokio::test]
    async fn files_marca_los_que_estan_en_vuelo() {
        let st = state_with(vec![]);
        for path in ["/logs/evt_1_app-1", "/logs/evt_1_app-2"] {
            st.store
                .put_parsed_log(ParsedLogFile::new(path, 1, 10, LogFileStatus::Success))
                .unwrap();
        }
        let _guard = st.try_claim(vec!["/logs/evt_1_app-2".into()]).unwrap();

        let (status, body) = get_json(st, "/api/v1/files").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let busy: Vec<&str> = rows
            .iter()
            .filter(|r| r["in_flight"] == true)
            .map(|r| r["file_path"].as_str().unwrap())
            .collect();
        assert_eq!(busy, vec!["/logs/evt_1_app-2"]);
        assert_eq!(rows[0]["status"], "SUCCESS");
    }
}
