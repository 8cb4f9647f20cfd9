//! Defines the Axum API routes and handlers.

use crate::config::Config;
use crate::file_manager::FileManager;
use crate::jobs::{JobId, JobRegistry, RegistryError};
use crate::pipeline::naming::allowed_file;
use crate::pipeline::{
    ArtifactKind, Pipeline, PipelineArtifact, PipelineError, PipelineOutcome, PipelineRequest, DEFAULT_TWEAK_OPTION,
};
use crate::relay::{ArtifactRelay, RelayTarget};
use crate::web::models::{CancelRequest, ConnectionResponse, PipelineForm, ProfileField};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Analysis of a returned g-code artifact, as JSON.
pub const ANALYSIS_HEADER: &str = "x-gcode-analysis";
/// Relay outcomes (flash messages), as a JSON array.
pub const RELAY_STATUS_HEADER: &str = "x-relay-status";

pub struct AppStateInner {
    pub pipeline: Pipeline,
    pub files: FileManager,
    pub config: Config,
}
pub type AppState = Arc<AppStateInner>;

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn pipeline_error(error: &PipelineError) -> Response {
    let status = match error {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Cancelled { .. } | PipelineError::DuplicateJob(_) => StatusCode::CONFLICT,
        PipelineError::LaunchFailed { .. } | PipelineError::ToolNotExecutable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::ToolFailed { .. } | PipelineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": error.to_string(), "kind": error.kind() })),
    )
        .into_response()
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_bytes;
    Router::new()
        .route("/", post(tweak_slice_file))
        .route("/tweak", post(tweak_slice_file))
        .route("/tweak/", post(tweak_slice_file))
        .route("/connection", get(connection))
        .route("/api/v1/cancel", post(cancel_handler))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/profiles", get(list_profiles))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Build the shared state from a configuration: one registry, one pipeline.
pub fn build_state(config: Config, relay: Arc<dyn ArtifactRelay>) -> AppState {
    let pipeline = Pipeline::from_config(&config, JobRegistry::new(), relay);
    let files = FileManager::new(&config.paths);
    Arc::new(AppStateInner { pipeline, files, config })
}

/// Handler for the tweak/slice pipeline submission.
async fn tweak_slice_file(State(state): State<AppState>, headers: HeaderMap, multipart: Multipart) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("pipeline_request", %request_id);
    handle_pipeline(state, headers, multipart).instrument(span).await
}

async fn handle_pipeline(state: AppState, headers: HeaderMap, multipart: Multipart) -> Response {
    let form = match read_form(multipart).await {
        Ok(form) => form,
        Err(response) => return response,
    };
    match &form.octoprint_url {
        Some(url) => tracing::info!("Getting request from octoprint server: {}", url),
        None => tracing::info!("Getting request from user interface"),
    }

    let request = match prepare_request(&state, form).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected request: {}", e);
            return pipeline_error(&e);
        }
    };

    let outcome = state.pipeline.run(&request).await;
    respond(&headers, outcome).await
}

async fn read_form(mut multipart: Multipart) -> Result<PipelineForm, Response> {
    let mut form = PipelineForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(json_error(&e.body_text(), e.status())),
        };
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        match (name.as_str(), file_name) {
            ("model", Some(file_name)) => {
                let content = field.bytes().await.map_err(|e| json_error(&e.body_text(), e.status()))?;
                form.model = Some((file_name, content.to_vec()));
            }
            ("profile", Some(file_name)) => {
                let content = field.bytes().await.map_err(|e| json_error(&e.body_text(), e.status()))?;
                form.profile = Some(ProfileField::Upload {
                    file_name,
                    content: content.to_vec(),
                });
            }
            (_, _) => {
                let value = field.text().await.map_err(|e| json_error(&e.body_text(), e.status()))?;
                form.set_text(&name, value);
            }
        }
    }
    Ok(form)
}

/// Validate the form, store the uploads and build the pipeline request.
async fn prepare_request(state: &AppState, form: PipelineForm) -> Result<PipelineRequest, PipelineError> {
    let from_octoprint = form.from_octoprint();
    let tweak_option = form.tweak_option.as_deref().unwrap_or(DEFAULT_TWEAK_OPTION);
    tracing::info!("Using Tweaker options: '{}'", tweak_option);
    // Parse before touching the disk so a bad option leaves no files behind.
    let request = PipelineRequest::new(PathBuf::new(), tweak_option)?;

    let (model_name, model_bytes) = form
        .model
        .ok_or_else(|| PipelineError::Validation("No model file in request".to_string()))?;
    if model_name.trim().is_empty() {
        return Err(PipelineError::Validation("No selected model".to_string()));
    }
    if !allowed_file(&model_name, &state.config.tools.allowed_extensions) {
        return Err(PipelineError::Validation(format!("Invalid model extension: '{model_name}'")));
    }
    if matches!(&form.profile, Some(ProfileField::Upload { file_name, .. }) if file_name.trim().is_empty()) {
        return Err(PipelineError::Validation("No selected profile".to_string()));
    }
    // Model first, so a failed save leaves no temporary profile behind.
    let model_path = state
        .files
        .save_upload(&model_name, &model_bytes)
        .await
        .map_err(|e| PipelineError::Validation(e.to_string()))?;
    let profile_path = match form.profile {
        Some(ProfileField::Upload { file_name, content }) => Some(
            state
                .files
                .save_profile(&file_name, &content)
                .await
                .map_err(|e| PipelineError::Validation(e.to_string()))?,
        ),
        Some(ProfileField::Named(name)) => state.files.resolve_named_profile(&name),
        None => None,
    };
    tracing::info!("Using profile: {:?}", profile_path);

    let relay_target = form.octoprint_url.map(|url| RelayTarget::new(url, form.apikey));

    Ok(PipelineRequest {
        model_path,
        ..request
    }
    .with_profile(profile_path)
    .with_output_name(form.machinecode_name)
    .with_relay(relay_target)
    .from_octoprint(from_octoprint))
}

async fn respond(headers: &HeaderMap, outcome: PipelineOutcome) -> Response {
    let relay_status = if outcome.relay.is_empty() {
        None
    } else {
        serde_json::to_string(&outcome.relay)
            .ok()
            .and_then(|json| HeaderValue::from_str(&json).ok())
    };
    let artifact = match outcome.result {
        Ok(artifact) => artifact,
        Err(e) => return pipeline_error(&e),
    };
    let body = match tokio::fs::read(&artifact.path).await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("Could not read artifact '{}': {}", artifact.path.display(), e);
            return json_error("Internal error", StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    tracing::debug!("Handling the download of '{}'", artifact.path.display());

    let mut response = Response::new(Body::from(body));
    let response_headers = response.headers_mut();
    response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    let wants_text = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "text/plain");
    if wants_text {
        response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    } else {
        response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        if let Some(value) = content_disposition(&artifact) {
            response_headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    if let (ArtifactKind::Gcode, Some(analysis)) = (artifact.kind, artifact.analysis) {
        if let Some(value) = serde_json::to_string(&analysis)
            .ok()
            .and_then(|json| HeaderValue::from_str(&json).ok())
        {
            response_headers.insert(ANALYSIS_HEADER, value);
        }
    }
    if let Some(value) = relay_status {
        response_headers.insert(RELAY_STATUS_HEADER, value);
    }
    response
}

fn content_disposition(artifact: &PipelineArtifact) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("inline; filename={}", artifact.name)).ok()
}

/// GET /connection: whether the service can take work.
async fn connection(State(state): State<AppState>) -> Response {
    let tweaker_available = state.config.tools.tweaker_available();
    let slicer_available = state.pipeline.tools().slicer.is_some();
    let (status, value) = if tweaker_available {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    };
    let body = ConnectionResponse {
        value: value.to_string(),
        tweaker_available,
        slicer_available,
    };
    (status, Json(body)).into_response()
}

/// POST /api/v1/cancel
async fn cancel_handler(State(state): State<AppState>, Json(payload): Json<CancelRequest>) -> Response {
    let job_id = JobId::new(payload.job_id);
    match state.pipeline.registry().request_cancel(&job_id) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "result": "ok" }))).into_response(),
        Err(e @ RegistryError::JobNotFound(_)) => json_error(&e.to_string(), StatusCode::NOT_FOUND),
        Err(e) => json_error(&e.to_string(), StatusCode::CONFLICT),
    }
}

/// GET /api/v1/jobs
async fn list_jobs(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.pipeline.registry().snapshot())).into_response()
}

/// GET /api/v1/profiles
async fn list_profiles(State(state): State<AppState>) -> Response {
    match state.files.list_profiles().await {
        Ok(profiles) => (StatusCode::OK, Json(profiles)).into_response(),
        Err(e) => {
            tracing::error!("Failed to list profiles: {}", e);
            json_error("Internal error", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
