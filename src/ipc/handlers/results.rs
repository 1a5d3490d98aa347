use crate::ipc::error::{err, respond};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_str, parse_actor, parse_scope, require_privileged,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::locks::CancelFlag;
use crate::results::{self, ComputeRequest, PublishAction, RemarkTarget, ResultsContext};
use serde_json::{json, Value};

fn handle_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
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
    let scale_id = match optional_str(req, "scaleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let recompute = match optional_bool(req, "recompute", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ResultsContext {
        conn,
        locks: &state.locks,
    };
    respond(
        &req.id,
        results::compute(
            &ctx,
            &ComputeRequest {
                scope: &scope,
                scale_id: scale_id.as_deref(),
                recompute,
                actor: &actor,
            },
            &CancelFlag::default(),
        ),
    )
}

fn handle_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
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
    let action_raw = match required_str(req, "action") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(action) = PublishAction::parse(&action_raw) else {
        return err(
            &req.id,
            "bad_params",
            "action must be one of: publish, unpublish",
            Some(json!({ "action": action_raw })),
        );
    };
    let ctx = ResultsContext {
        conn,
        locks: &state.locks,
    };
    tracing::debug!(actor = actor.attribution(), scope = %scope, "publish requested");
    respond(
        &req.id,
        results::publish(&ctx, &scope, action).map(|n| json!({ "updated": n })),
    )
}

fn handle_term_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match parse_actor(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(
        &req.id,
        results::list_term_results(conn, &scope, &actor).map(|rows| json!({ "results": rows })),
    )
}

fn handle_term_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match parse_actor(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match optional_str(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match optional_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(
        &req.id,
        results::term_results_for_student(
            conn,
            &student_id,
            term.as_deref(),
            academic_year.as_deref(),
            &actor,
        )
        .map(|rows| json!({ "results": rows })),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match parse_actor(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_result_id = match required_str(req, "termResultId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(
        &req.id,
        results::subject_results(conn, &term_result_id, &actor)
            .map(|rows| json!({ "subjects": rows })),
    )
}

fn handle_class_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match parse_actor(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(&req.id, results::class_summary(conn, &scope, &actor))
}

fn handle_remarks_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let remarks = match req.params.get("remarks") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => return err(&req.id, "bad_params", "remarks must be a string or null", None),
    };
    let term_result_id = req.params.get("termResultId").and_then(|v| v.as_str());
    let subject_result_id = req.params.get("subjectResultId").and_then(|v| v.as_str());
    let target = match (term_result_id, subject_result_id) {
        (Some(id), None) => RemarkTarget::TermResult(id),
        (None, Some(id)) => RemarkTarget::SubjectResult(id),
        _ => {
            return err(
                &req.id,
                "bad_params",
                "pass exactly one of termResultId, subjectResultId",
                None,
            )
        }
    };
    respond(
        &req.id,
        results::update_remarks(conn, target, remarks).map(|_| json!({ "ok": true })),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.compute" => Some(handle_compute(state, req)),
        "results.publish" => Some(handle_publish(state, req)),
        "results.term.list" => Some(handle_term_list(state, req)),
        "results.term.forStudent" => Some(handle_term_for_student(state, req)),
        "results.subjects.list" => Some(handle_subjects_list(state, req)),
        "results.classSummary" => Some(handle_class_summary(state, req)),
        "results.remarks.update" => Some(handle_remarks_update(state, req)),
        _ => None,
    }
}
