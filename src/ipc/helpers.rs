use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

use crate::error::ResultsError;
use crate::ipc::error::{err, err_from};
use crate::ipc::types::{AppState, Request};
use crate::scope::{Actor, Scope};

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(err(&req.id, "bad_params", format!("{} must be a string", key), None)),
    }
}

pub fn optional_bool(req: &Request, key: &str, default: bool) -> Result<bool, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(err(&req.id, "bad_params", format!("{} must be boolean", key), None)),
    }
}

/// Deserializes one param into a typed value.
pub fn param<T: DeserializeOwned>(req: &Request, key: &str) -> Result<T, Value> {
    let raw = req
        .params
        .get(key)
        .cloned()
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    serde_json::from_value(raw).map_err(|e| {
        err(
            &req.id,
            "bad_params",
            format!("invalid {}: {}", key, e),
            None,
        )
    })
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn workspace<'a>(state: &'a AppState, req: &Request) -> Result<&'a Path, Value> {
    state
        .workspace
        .as_deref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn parse_scope(req: &Request) -> Result<Scope, Value> {
    let classroom_id = required_str(req, "classroomId")?;
    let term = required_str(req, "term")?;
    let academic_year = required_str(req, "academicYear")?;
    Ok(Scope::new(&classroom_id, &term, &academic_year))
}

/// Missing actor means an anonymous, non-privileged caller.
pub fn parse_actor(req: &Request) -> Result<Actor, Value> {
    match req.params.get("actor") {
        None | Some(Value::Null) => Ok(Actor::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            err(
                &req.id,
                "bad_params",
                format!("invalid actor: {}", e),
                None,
            )
        }),
    }
}

pub fn require_privileged(req: &Request) -> Result<Actor, Value> {
    let actor = parse_actor(req)?;
    if !actor.privileged {
        let e = ResultsError::Forbidden(format!("{} requires a privileged actor", req.method));
        return Err(err_from(&req.id, &e));
    }
    Ok(actor)
}
