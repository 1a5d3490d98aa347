use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scales;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "runningJobs": state
                .jobs
                .list()
                .iter()
                .filter(|j| j.finished_at.is_none())
                .count()
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            // Best-effort: a fresh workspace gets the standard grade scale.
            // This must not prevent the workspace from opening.
            let provisioned = match scales::ensure_default_scale(&conn) {
                Ok((_, created)) => created,
                Err(e) => {
                    tracing::warn!(error = %e, "could not provision default grade scale");
                    false
                }
            };
            tracing::info!(workspace = %path.to_string_lossy(), provisioned, "workspace selected");
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "defaultScaleProvisioned": provisioned
                }),
            )
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
