use crate::ipc::error::{err, ok, respond};
use crate::ipc::helpers::{
    optional_bool, optional_str, parse_scope, require_privileged, required_str, workspace,
};
use crate::ipc::types::{AppState, Request};
use crate::jobs::JobKind;
use serde_json::json;

fn handle_jobs_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let ws = match workspace(state, req) {
        Ok(v) => v.to_path_buf(),
        Err(e) => return e,
    };
    let actor = match require_privileged(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind_raw = match required_str(req, "kind") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind = match kind_raw.as_str() {
        "compute" => {
            let scale_id = match optional_str(req, "scaleId") {
                Ok(v) => v,
                Err(e) => return e,
            };
            let recompute = match optional_bool(req, "recompute", false) {
                Ok(v) => v,
                Err(e) => return e,
            };
            JobKind::Compute {
                scope,
                scale_id,
                recompute,
            }
        }
        "bulkGenerate" => {
            let regenerate = match optional_bool(req, "regenerate", false) {
                Ok(v) => v,
                Err(e) => return e,
            };
            JobKind::BulkGenerate { scope, regenerate }
        }
        other => {
            return err(
                &req.id,
                "bad_params",
                "kind must be one of: compute, bulkGenerate",
                Some(json!({ "kind": other })),
            )
        }
    };
    respond(&req.id, state.jobs.start(ws, state.locks.clone(), kind, actor))
}

fn handle_jobs_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let job_id = match required_str(req, "jobId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(&req.id, state.jobs.status(&job_id))
}

fn handle_jobs_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let job_id = match required_str(req, "jobId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(&req.id, state.jobs.cancel(&job_id))
}

fn handle_jobs_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, json!({ "jobs": state.jobs.list() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "jobs.start" => Some(handle_jobs_start(state, req)),
        "jobs.status" => Some(handle_jobs_status(state, req)),
        "jobs.cancel" => Some(handle_jobs_cancel(state, req)),
        "jobs.list" => Some(handle_jobs_list(state, req)),
        _ => None,
    }
}
