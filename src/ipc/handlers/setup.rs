use crate::config::{self, SetupSection};
use crate::ipc::error::{err, err_from, ok};
use crate::ipc::helpers::{db_conn, require_privileged};
use crate::ipc::types::{AppState, Request};
use serde_json::{Map, Value};

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match config::load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match require_privileged(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    match config::update_section(conn, section, patch_obj) {
        Ok(current) => {
            tracing::info!(
                section = section.name(),
                actor = actor.attribution(),
                fields = patch_obj.len(),
                "setup updated"
            );
            ok(&req.id, current)
        }
        Err(e) => err_from(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
