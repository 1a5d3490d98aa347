use crate::ipc::error::respond;
use crate::ipc::helpers::{db_conn, param, parse_scope, require_privileged, required_str};
use crate::ipc::types::{AppState, Request};
use crate::sources::{self, EnrolledStudent, MarkEntryInput, Subject};
use serde_json::json;

fn handle_subjects_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let subjects: Vec<Subject> = match param(req, "subjects") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(
        &req.id,
        sources::upsert_subjects(conn, &subjects).map(|n| json!({ "upserted": n })),
    )
}

fn handle_roster_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let students: Vec<EnrolledStudent> = match param(req, "students") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_ids: Vec<String> = match param(req, "subjectIds") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(
        &req.id,
        sources::set_roster(conn, &scope, &students, &subject_ids).map(|_| {
            json!({
                "scope": scope,
                "students": students.len(),
                "subjects": subject_ids.len()
            })
        }),
    )
}

fn handle_marks_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_privileged(req) {
        return e;
    }
    let term = match required_str(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match required_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entries: Vec<MarkEntryInput> = match param(req, "entries") {
        Ok(v) => v,
        Err(e) => return e,
    };
    respond(
        &req.id,
        sources::upsert_marks(conn, &term, &academic_year, &entries).map(|n| json!({ "upserted": n })),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sources.subjects.upsert" => Some(handle_subjects_upsert(state, req)),
        "sources.roster.set" => Some(handle_roster_set(state, req)),
        "sources.marks.upsert" => Some(handle_marks_upsert(state, req)),
        _ => None,
    }
}
