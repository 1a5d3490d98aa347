use crate::artifacts::{self, ArtifactContext};
use crate::ipc::error::{err, respond};
use crate::ipc::helpers::{
    db_conn, optional_bool, parse_actor, parse_scope, require_privileged, required_str,
    workspace,
};
use crate::ipc::types::{AppState, Request};
use crate::locks::CancelFlag;
use base64::Engine;
use serde_json::json;
use std::path::PathBuf;

fn handle_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ws = match workspace(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match require_privileged(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_result_id = match required_str(req, "termResultId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let regenerate = match optional_bool(req, "regenerate", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ArtifactContext {
        conn,
        workspace: ws,
    };
    respond(
        &req.id,
        artifacts::generate(&ctx, &term_result_id, regenerate, &actor),
    )
}

fn handle_bulk_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ws = match workspace(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match require_privileged(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let regenerate = match optional_bool(req, "regenerate", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ArtifactContext {
        conn,
        workspace: ws,
    };
    respond(
        &req.id,
        artifacts::bulk_generate(&ctx, &scope, regenerate, &actor, &CancelFlag::default()),
    )
}

fn handle_download(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ws = match workspace(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match parse_actor(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let artifact_id = match required_str(req, "artifactId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ArtifactContext {
        conn,
        workspace: ws,
    };
    respond(
        &req.id,
        artifacts::download(&ctx, &artifact_id, &actor).map(|d| {
            json!({
                "contentType": d.artifact.content_type,
                "encoding": "base64",
                "dataBase64": base64::engine::general_purpose::STANDARD.encode(&d.bytes),
                "artifact": d.artifact,
            })
        }),
    )
}

fn handle_artifacts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(
        &req.id,
        artifacts::list_artifacts(conn, &scope).map(|rows| json!({ "artifacts": rows })),
    )
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    if out_path.is_dir() {
        return err(&req.id, "bad_params", "outPath must be a file path", None);
    }
    respond(&req.id, artifacts::export_bundle(conn, &scope, &out_path))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.generate" => Some(handle_generate(state, req)),
        "reports.bulkGenerate" => Some(handle_bulk_generate(state, req)),
        "reports.download" => Some(handle_download(state, req)),
        "reports.artifacts.list" => Some(handle_artifacts_list(state, req)),
        "reports.exportBundle" => Some(handle_export_bundle(state, req)),
        _ => None,
    }
}
