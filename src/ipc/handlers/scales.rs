use crate::grading::GradeScaleRule;
use crate::ipc::error::{err_from, ok, respond};
use crate::ipc::helpers::{db_conn, optional_bool, param, require_privileged, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scales;
use serde_json::json;

fn handle_scales_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rules: Vec<GradeScaleRule> = match param(req, "rules") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let make_default = match optional_bool(req, "makeDefault", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(&req.id, scales::create_scale(conn, &name, &rules, make_default))
}

fn handle_scales_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match scales::list_scales(conn) {
        Ok(list) => ok(&req.id, json!({ "scales": list })),
        Err(e) => err_from(&req.id, &e),
    }
}

fn handle_scales_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale_id = match required_str(req, "scaleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(&req.id, scales::get_scale(conn, &scale_id))
}

fn handle_scales_set_default(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let scale_id = match required_str(req, "scaleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(&req.id, scales::set_default(conn, &scale_id))
}

fn handle_scales_ensure_default(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    respond(
        &req.id,
        scales::ensure_default_scale(conn)
            .map(|(scale, created)| json!({ "scale": scale, "created": created })),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scales.create" => Some(handle_scales_create(state, req)),
        "scales.list" => Some(handle_scales_list(state, req)),
        "scales.get" => Some(handle_scales_get(state, req)),
        "scales.setDefault" => Some(handle_scales_set_default(state, req)),
        "scales.ensureDefault" => Some(handle_scales_ensure_default(state, req)),
        _ => None,
    }
}
