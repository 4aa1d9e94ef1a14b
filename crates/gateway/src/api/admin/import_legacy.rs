//! Legacy one-shot OpenClaw import endpoints, kept for callers that predate
//! the staging-based preview/apply flow in [`super::import_staging`]. These
//! compose the same underlying scan/copy logic in a single request instead
//! of a preview-then-apply round trip, and never leave a staging directory
//! behind.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::api::import_openclaw::{ImportOptions, ImportSource, MergeStrategy};
use crate::state::AppState;

use super::guard::AdminGuard;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/admin/import/openclaw/scan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub source: ImportSource,
    #[serde(default)]
    pub options: ImportOptions,
}

#[derive(Debug, Serialize)]
pub struct ScannedAgent {
    pub agent_id: String,
    pub session_files: u32,
    pub has_models_json: bool,
    pub has_auth_profiles_json: bool,
}

#[derive(Debug, Serialize)]
pub struct ScannedWorkspace {
    pub name: String,
    pub approx_files: u32,
    pub approx_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct ScanResult {
    pub agents: Vec<ScannedAgent>,
    pub workspaces: Vec<ScannedWorkspace>,
    pub approx_files: u32,
    pub approx_bytes: u64,
    pub sensitive_files_found: usize,
}

pub async fn scan_openclaw(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    let staging_root = state.import_root.join("openclaw");
    let ws_dest = state.config.workspace.path.clone();
    let sess_dest = state.config.workspace.state_path.join("sessions");

    let preview = match crate::import::openclaw::preview_openclaw_import(
        req.source,
        req.options,
        &staging_root,
        &ws_dest,
        &sess_dest,
    )
    .await
    {
        Ok(p) => p,
        Err(e) => return map_import_err(e).into_response(),
    };

    // One-shot scan never needs the staged extraction; drop it immediately.
    let _ = crate::import::openclaw::delete_staging(&state.import_root, &preview.staging_id).await;

    let result = ScanResult {
        agents: preview
            .inventory
            .agents
            .into_iter()
            .map(|a| ScannedAgent {
                agent_id: a.agent_id,
                session_files: a.session_files,
                has_models_json: a.has_models_json,
                has_auth_profiles_json: a.has_auth_profiles_json,
            })
            .collect(),
        workspaces: preview
            .inventory
            .workspaces
            .into_iter()
            .map(|w| ScannedWorkspace {
                name: w.name,
                approx_files: w.approx_files,
                approx_bytes: w.approx_bytes,
            })
            .collect(),
        approx_files: preview.inventory.totals.approx_files,
        approx_bytes: preview.inventory.totals.approx_bytes,
        sensitive_files_found: preview.sensitive.sensitive_files.len(),
    };

    Json(result).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/admin/import/openclaw/apply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ImportApplyRequest {
    pub source: ImportSource,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub options: ImportOptions,
}

#[derive(Debug, Serialize)]
pub struct ImportApplyResult {
    pub agents_imported: Vec<String>,
    pub workspaces_imported: Vec<String>,
    pub sessions_copied: u32,
    pub schedules_imported: Vec<String>,
    pub warnings: Vec<String>,
}

pub async fn apply_openclaw_import(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<ImportApplyRequest>,
) -> impl IntoResponse {
    let staging_root = state.import_root.join("openclaw");
    let ws_dest = state.config.workspace.path.clone();
    let sess_dest = state.config.workspace.state_path.join("sessions");
    let merge_strategy = req.merge_strategy.unwrap_or(MergeStrategy::MergeSafe);

    let preview = match crate::import::openclaw::preview_openclaw_import(
        req.source,
        req.options.clone(),
        &staging_root,
        &ws_dest,
        &sess_dest,
    )
    .await
    {
        Ok(p) => p,
        Err(e) => return map_import_err(e).into_response(),
    };

    let staging_id = preview.staging_id;
    let extracted_dir = staging_root.join(staging_id.to_string()).join("extracted");

    let apply_result = crate::import::openclaw::apply_openclaw_import(
        crate::api::import_openclaw::ImportApplyRequest {
            staging_id,
            merge_strategy,
            options: req.options,
        },
        &staging_root,
        &ws_dest,
        &sess_dest,
    )
    .await;

    // One-shot apply never leaves staging behind, success or failure.
    let _ = crate::import::openclaw::delete_staging(&state.import_root, &staging_id).await;

    let resp = match apply_result {
        Ok(r) => r,
        Err(e) => return map_import_err(e).into_response(),
    };

    let schedule_names = crate::import::openclaw::import_schedules(
        &extracted_dir,
        &state.schedule_store,
        &state.config.sessions.agent_id,
    )
    .await;

    state.workspace.refresh();

    let mut warnings = resp.warnings;
    if !schedule_names.is_empty() {
        warnings.push(format!(
            "imported {} schedule(s) (disabled): {}",
            schedule_names.len(),
            schedule_names.join(", "),
        ));
    }

    Json(ImportApplyResult {
        agents_imported: resp.imported.agents,
        workspaces_imported: resp.imported.workspaces,
        sessions_copied: resp.imported.sessions_copied,
        schedules_imported: schedule_names,
        warnings,
    })
    .into_response()
}

fn map_import_err(
    e: crate::import::openclaw::OpenClawImportError,
) -> (StatusCode, Json<serde_json::Value>) {
    let msg = e.to_string();
    let code = match &e {
        crate::import::openclaw::OpenClawImportError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        crate::import::openclaw::OpenClawImportError::ArchiveInvalid(_) => StatusCode::BAD_REQUEST,
        crate::import::openclaw::OpenClawImportError::SizeLimitExceeded(_) => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        crate::import::openclaw::OpenClawImportError::SshFailed(_) => StatusCode::BAD_GATEWAY,
        crate::import::openclaw::OpenClawImportError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        crate::import::openclaw::OpenClawImportError::Json(_) => StatusCode::BAD_REQUEST,
    };
    (code, Json(serde_json::json!({ "error": msg })))
}
