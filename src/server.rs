use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::analysis::AnalysisService;
use crate::db::Database;
use crate::error::PipelineError;
use crate::generation::GenerationService;
use crate::ingest::Ingestor;
use crate::models::{
    Chapter, DocumentContent, FileRecord, Material, MaterialBinding, MaterialKind, Project,
    TaskKind, TaskRecord, TenderAnalysis,
};
use crate::storage::BlobStore;
use crate::tasks::TaskRunner;

#[derive(Clone)]
struct AppState {
    db: Database,
    storage: BlobStore,
    analysis: AnalysisService,
    generation: GenerationService,
    ingestor: Ingestor,
    runner: TaskRunner,
}

#[allow(clippy::too_many_arguments)]
pub async fn run_server(
    config: crate::AppConfig,
    db: Database,
    storage: BlobStore,
    analysis: AnalysisService,
    generation: GenerationService,
    ingestor: Ingestor,
    runner: TaskRunner,
) -> Result<()> {
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let state = AppState {
        db,
        storage,
        analysis,
        generation,
        ingestor,
        runner,
    };

    let app = Router::new()
        .route("/api/projects", post(create_project).get(list_projects))
        .route(
            "/api/projects/:project_id",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/files/:project_id/upload", post(upload_files))
        .route("/api/files/:file_id/download", get(download_file))
        .route("/api/analysis/:project_id", post(run_analysis).get(run_analysis))
        .route("/api/generation/:project_id", post(start_generation))
        .route("/api/generation/:project_id/latest", get(latest_generation))
        .route("/api/pipeline/ingest/:project_id", post(start_ingest))
        .route("/api/tasks/:task_id", get(get_task))
        .route("/api/document/:project_id", get(get_document))
        .route(
            "/api/document/:project_id/structure",
            get(get_structure).post(save_structure),
        )
        .route("/api/materials", get(list_materials))
        .route("/api/materials/upload", post(upload_material))
        .route("/api/materials/bind", post(bind_material))
        .route("/api/materials/bindings", get(list_bindings))
        .route("/api/materials/bindings/:binding_id", delete(unbind_material))
        .route("/api/exports/*object_name", get(download_export))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// --- projects ---

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    description: Option<String>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::from(PipelineError::Validation(
            "项目名称不能为空".to_string(),
        )));
    }
    let project = state
        .db
        .create_project(request.name.trim(), request.description.as_deref())
        .await?;
    Ok(Json(project))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.db.list_projects().await?))
}

async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;
    Ok(Json(project))
}

#[derive(Deserialize)]
struct UpdateProjectRequest {
    status: String,
}

async fn update_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(request): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;
    state
        .db
        .update_project_status(project_id, &request.status)
        .await?;
    let project = state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db.delete_project(project_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "project not found: {project_id}"
        )))
    }
}

// --- files ---

async fn upload_files(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    mut multipart: Multipart,
) -> Result<Json<Vec<FileRecord>>, ApiError> {
    state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;

    let mut stored = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read upload: {err}")))?;

        let object_name = format!("tenders/{project_id}/{}_{filename}", Uuid::new_v4());
        state.storage.put(&object_name, &bytes).await?;
        let record = state
            .db
            .insert_file(
                project_id,
                &filename,
                &object_name,
                content_type.as_deref(),
                bytes.len() as i64,
            )
            .await?;
        stored.push(record);
    }

    if stored.is_empty() {
        return Err(ApiError::bad_request(
            "multipart body contained no files".to_string(),
        ));
    }
    Ok(Json(stored))
}

async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let file = state
        .db
        .get_file(file_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("file not found: {file_id}")))?;

    let bytes = state.storage.get(&file.object_name).await?;
    Ok(file_response(bytes, &file.filename, file.content_type.as_deref()))
}

async fn download_export(
    State(state): State<AppState>,
    Path(object_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !object_name.starts_with("exports/") {
        return Err(ApiError::not_found(format!(
            "export not found: {object_name}"
        )));
    }
    let bytes = state
        .storage
        .get(&object_name)
        .await
        .map_err(|_| ApiError::not_found(format!("export not found: {object_name}")))?;
    let filename = object_name.rsplit('/').next().unwrap_or("export.docx");
    Ok(file_response(
        bytes,
        filename,
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ))
}

fn file_response(bytes: Vec<u8>, filename: &str, content_type: Option<&str>) -> impl IntoResponse {
    let headers = [
        (
            header::CONTENT_TYPE,
            content_type
                .unwrap_or("application/octet-stream")
                .to_string(),
        ),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename*=UTF-8''{}", urlencode(filename)),
        ),
    ];
    (headers, bytes)
}

fn urlencode(input: &str) -> String {
    let mut out = String::new();
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
                out.push(*byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// --- analysis ---

#[derive(Deserialize)]
struct AnalysisQuery {
    #[serde(default)]
    refresh: bool,
}

async fn run_analysis(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Query(query): Query<AnalysisQuery>,
) -> Result<Json<TenderAnalysis>, ApiError> {
    let analysis = state.analysis.analyze(project_id, query.refresh).await?;
    Ok(Json(analysis))
}

// --- background jobs ---

async fn start_generation(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<TaskRecord>, ApiError> {
    state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;

    let generation = state.generation.clone();
    let task = state
        .runner
        .submit(project_id, TaskKind::Generation, move || async move {
            generation.generate(project_id).await
        })
        .await?;
    Ok(Json(task))
}

async fn latest_generation(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<TaskRecord>, ApiError> {
    let task = state
        .db
        .latest_task(project_id, TaskKind::Generation)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("no generation task for project {project_id}"))
        })?;
    Ok(Json(task))
}

async fn start_ingest(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<TaskRecord>, ApiError> {
    state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;

    let ingestor = state.ingestor.clone();
    let task = state
        .runner
        .submit(project_id, TaskKind::Ingest, move || async move {
            let chunks = ingestor.ingest_project(project_id).await?;
            Ok(serde_json::json!({ "chunks": chunks }))
        })
        .await?;
    Ok(Json(task))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskRecord>, ApiError> {
    let task = state
        .db
        .get_task(task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task not found: {task_id}")))?;
    Ok(Json(task))
}

// --- document content ---

async fn get_document(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<DocumentContent>, ApiError> {
    let content = state
        .db
        .document_content(project_id)
        .await?
        .unwrap_or_default();
    Ok(Json(content))
}

async fn get_structure(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<Chapter>>, ApiError> {
    let content = state
        .db
        .document_content(project_id)
        .await?
        .unwrap_or_default();
    Ok(Json(content.structure))
}

/// Replace the editable outline, keeping any generated prose as is.
async fn save_structure(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(structure): Json<Vec<Chapter>>,
) -> Result<Json<DocumentContent>, ApiError> {
    state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;

    let mut content = state
        .db
        .document_content(project_id)
        .await?
        .unwrap_or_default();
    content.structure = structure;
    state.db.save_document_content(project_id, &content).await?;
    Ok(Json(content))
}

// --- materials ---

async fn list_materials(State(state): State<AppState>) -> Result<Json<Vec<Material>>, ApiError> {
    Ok(Json(state.db.list_materials().await?))
}

async fn upload_material(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Material>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read upload: {err}")))?;

        let kind = MaterialKind::guess(&filename, content_type.as_deref());
        let object_name = format!("materials/{}_{filename}", Uuid::new_v4());
        state.storage.put(&object_name, &bytes).await?;
        let material = state
            .db
            .insert_material(kind, &filename, bytes.len() as i64, &object_name)
            .await?;
        return Ok(Json(material));
    }

    Err(ApiError::bad_request(
        "multipart body contained no files".to_string(),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindRequest {
    project_id: i64,
    placeholder_key: String,
    material_id: i64,
}

async fn bind_material(
    State(state): State<AppState>,
    Json(request): Json<BindRequest>,
) -> Result<Json<MaterialBinding>, ApiError> {
    state
        .db
        .get_project(request.project_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("project not found: {}", request.project_id))
        })?;
    state
        .db
        .get_material(request.material_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("material not found: {}", request.material_id))
        })?;
    if request.placeholder_key.trim().is_empty() {
        return Err(ApiError::bad_request("占位符不能为空".to_string()));
    }

    let binding = state
        .db
        .insert_binding(
            request.project_id,
            request.placeholder_key.trim(),
            request.material_id,
        )
        .await?;
    Ok(Json(binding))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingsQuery {
    project_id: i64,
}

async fn list_bindings(
    State(state): State<AppState>,
    Query(query): Query<BindingsQuery>,
) -> Result<Json<Vec<MaterialBinding>>, ApiError> {
    Ok(Json(state.db.bindings_for_project(query.project_id).await?))
}

async fn unbind_material(
    State(state): State<AppState>,
    Path(binding_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db.delete_binding(binding_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "binding not found: {binding_id}"
        )))
    }
}

// --- error mapping ---

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(value: PipelineError) -> Self {
        let status = match &value {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Upstream(_) | PipelineError::Parse(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Config(_) | PipelineError::Export(_) | PipelineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
