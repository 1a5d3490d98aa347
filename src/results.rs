use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::config::{ComputationConfig, GpaMode};
use crate::db::{self, now_ts};
use crate::error::{Result, ResultsError};
use crate::grading::{self, class_statistics, grade_for, percentage, round_to, GradeScale};
use crate::locks::{CancelFlag, ScopeLocks};
use crate::scales;
use crate::scope::{Actor, Scope};
use crate::sources::{
    aggregate_student, EnrolledStudent, MarkSource, Roster, SqliteSources, StudentMarks,
};

pub const MAX_REMARK_CHARS: usize = 1000;

#[derive(Debug, Clone)]
pub struct ResultsContext<'a> {
    pub conn: &'a Connection,
    pub locks: &'a ScopeLocks,
}

#[derive(Debug, Clone)]
pub struct ComputeRequest<'a> {
    pub scope: &'a Scope,
    pub scale_id: Option<&'a str>,
    pub recompute: bool,
    pub actor: &'a Actor,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentIssue {
    pub student: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComputeSummary {
    pub scope: Scope,
    pub grade_scale_id: String,
    pub recomputed: bool,
    pub total: usize,
    pub computed: usize,
    pub failed: usize,
    pub flagged: Vec<StudentIssue>,
    pub errors: Vec<StudentIssue>,
}

#[derive(Debug, Clone)]
struct SubjectDraft {
    subject_id: String,
    ca_score: f64,
    ca_max: f64,
    exam_score: f64,
    exam_max: f64,
    total_score: f64,
    total_possible: f64,
    percentage: f64,
    grade: String,
    point: f64,
    marks_missing: bool,
    rank_in_subject: u32,
    class_average: f64,
    highest: f64,
    lowest: f64,
}

#[derive(Debug, Clone)]
struct StudentDraft {
    student_id: String,
    total_marks: f64,
    total_possible: f64,
    average_percentage: f64,
    overall_grade: String,
    gpa: f64,
    flagged: bool,
    subjects: Vec<SubjectDraft>,
    rank_in_class: u32,
}

#[derive(Debug, Clone)]
struct PriorRow {
    id: String,
    student_id: String,
    classroom_id: String,
    remarks: Option<String>,
    is_published: bool,
    published_at: Option<String>,
}

fn build_student(
    student: &EnrolledStudent,
    marks: StudentMarks,
    scale: &GradeScale,
    cfg: &ComputationConfig,
) -> Result<StudentDraft> {
    let dp = cfg.decimal_places;
    let mut subjects = Vec::with_capacity(marks.subjects.len());
    let mut total_marks = 0.0_f64;
    let mut total_possible = 0.0_f64;
    let mut point_sum = 0.0_f64;
    let mut point_weight = 0.0_f64;

    for s in marks.subjects {
        let total_score = round_to(s.total_score, dp);
        let pct = round_to(percentage(total_score, s.total_possible), dp);
        let grade = grade_for(pct, scale)?;
        let weight = match cfg.gpa_mode {
            GpaMode::Simple => 1.0,
            GpaMode::CreditWeighted => s.subject.credit_units,
        };
        point_sum += grade.point * weight;
        point_weight += weight;
        total_marks += total_score;
        total_possible += s.total_possible;
        subjects.push(SubjectDraft {
            subject_id: s.subject.id.clone(),
            ca_score: s.ca_score,
            ca_max: s.ca_max,
            exam_score: s.exam_score,
            exam_max: s.exam_max,
            total_score,
            total_possible: s.total_possible,
            percentage: pct,
            grade: grade.letter,
            point: grade.point,
            marks_missing: s.marks_missing,
            rank_in_subject: 0,
            class_average: 0.0,
            highest: 0.0,
            lowest: 0.0,
        });
    }

    let average_percentage = round_to(percentage(total_marks, total_possible), dp);
    let overall = grade_for(average_percentage, scale)?;
    let gpa = if point_weight > 0.0 {
        round_to(point_sum / point_weight, dp)
    } else {
        0.0
    };
    Ok(StudentDraft {
        student_id: student.id.clone(),
        total_marks: round_to(total_marks, dp),
        total_possible,
        average_percentage,
        overall_grade: overall.letter,
        gpa,
        flagged: !marks.missing_subjects.is_empty(),
        subjects,
        rank_in_class: 0,
    })
}

/// Ranks the complete snapshot: class positions by average, then subject
/// positions and statistics per subject. Never called on a partial scope.
fn rank_scope(drafts: &mut [StudentDraft], dp: u32) {
    let averages: Vec<f64> = drafts.iter().map(|d| d.average_percentage).collect();
    for (d, r) in drafts.iter_mut().zip(grading::rank(&averages)) {
        d.rank_in_class = r;
    }

    let mut by_subject: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();
    for (di, d) in drafts.iter().enumerate() {
        for (si, s) in d.subjects.iter().enumerate() {
            by_subject
                .entry(s.subject_id.clone())
                .or_default()
                .push((di, si));
        }
    }
    for slots in by_subject.values() {
        let pcts: Vec<f64> = slots
            .iter()
            .map(|&(di, si)| drafts[di].subjects[si].percentage)
            .collect();
        let stats = class_statistics(&pcts);
        let ranks = grading::rank(&pcts);
        for (&(di, si), r) in slots.iter().zip(ranks) {
            let s = &mut drafts[di].subjects[si];
            s.rank_in_subject = r;
            s.class_average = round_to(stats.average, dp);
            s.highest = stats.highest;
            s.lowest = stats.lowest;
        }
    }
}

fn scope_param_values(scope: &Scope) -> [Value; 5] {
    [
        Value::Text(scope.term.clone()),
        Value::Text(scope.academic_year.clone()),
        Value::Text(scope.classroom_id.clone()),
        Value::Text(scope.classroom_id.clone()),
        Value::Text(scope.term.clone()),
    ]
}

fn prior_rows(conn: &Connection, scope: &Scope) -> Result<Vec<PriorRow>> {
    // Rows of this classroom plus rows of currently enrolled students that
    // were computed under another classroom for the same term.
    let mut stmt = conn.prepare(
        "SELECT id, student_id, classroom_id, remarks, is_published, published_at
         FROM term_results
         WHERE term = ?1 AND academic_year = ?2
           AND (classroom_id = ?3 OR student_id IN (
                SELECT student_id FROM enrollments
                WHERE classroom_id = ?4 AND term = ?5 AND academic_year = ?2))
         ORDER BY student_id",
    )?;
    let rows = stmt
        .query_map(params_from_iter(scope_param_values(scope)), |r| {
            Ok(PriorRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                classroom_id: r.get(2)?,
                remarks: r.get(3)?,
                is_published: r.get::<_, i64>(4)? != 0,
                published_at: r.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn prior_teacher_remarks(
    conn: &Connection,
    prior: &[PriorRow],
) -> Result<HashMap<(String, String), String>> {
    let mut out = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT subject_id, teacher_remarks FROM subject_results
         WHERE term_result_id = ? AND teacher_remarks IS NOT NULL",
    )?;
    for p in prior {
        let rows = stmt
            .query_map([&p.id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (subject_id, remark) in rows {
            out.insert((p.student_id.clone(), subject_id), remark);
        }
    }
    Ok(out)
}

pub fn compute(
    ctx: &ResultsContext<'_>,
    req: &ComputeRequest<'_>,
    cancel: &CancelFlag,
) -> Result<ComputeSummary> {
    let sources = SqliteSources::new(ctx.conn);
    compute_with_sources(ctx, &sources, &sources, req, cancel)
}

/// Computes, ranks and stores every result of one scope in a single
/// transaction. Per-student source problems are reported in the summary;
/// anything else aborts the pass and nothing is written.
pub fn compute_with_sources(
    ctx: &ResultsContext<'_>,
    roster: &dyn Roster,
    marks: &dyn MarkSource,
    req: &ComputeRequest<'_>,
    cancel: &CancelFlag,
) -> Result<ComputeSummary> {
    let scope = req.scope;
    let _guard = ctx.locks.acquire(scope)?;
    let conn = ctx.conn;

    let cfg = ComputationConfig::load(conn)?;
    let scale = scales::resolve_scale(conn, req.scale_id)?;

    let tx = db::begin_write(conn)?;
    let prior = prior_rows(&tx, scope)?;
    // Taking over another classroom's rows would leave its ranking stale.
    if let Some(other) = prior.iter().find(|p| p.classroom_id != scope.classroom_id) {
        let students = prior
            .iter()
            .filter(|p| p.classroom_id == other.classroom_id)
            .map(|p| p.student_id.clone())
            .collect();
        return Err(ResultsError::ClassroomConflict {
            classroom_id: other.classroom_id.clone(),
            students,
        });
    }
    if !prior.is_empty() && !req.recompute {
        return Err(ResultsError::AlreadyComputed {
            students: prior.len(),
        });
    }

    let students = roster.enrolled(scope)?;
    let subjects = marks.subjects_for(scope)?;
    if !students.is_empty() && subjects.is_empty() {
        return Err(ResultsError::SourceDataMissing(format!(
            "no subjects are offered to {}",
            scope
        )));
    }
    tracing::info!(
        scope = %scope,
        students = students.len(),
        subjects = subjects.len(),
        recompute = req.recompute,
        scale = %scale.name,
        "computing results"
    );

    let mut drafts: Vec<StudentDraft> = Vec::with_capacity(students.len());
    let mut errors = Vec::new();
    let mut flagged = Vec::new();
    for student in &students {
        cancel.check()?;
        let built = aggregate_student(marks, scope, &subjects, &student.id, &cfg).and_then(|m| {
            let missing = m.missing_subjects.clone();
            build_student(student, m, &scale, &cfg).map(|d| (d, missing))
        });
        match built {
            Ok((draft, missing)) => {
                if !missing.is_empty() {
                    flagged.push(StudentIssue {
                        student: student.id.clone(),
                        reason: "SourceDataMissing".into(),
                        message: "marks missing for some subjects; scored as 0".into(),
                        subjects: missing,
                    });
                }
                drafts.push(draft);
            }
            Err(e @ (ResultsError::SourceDataMissing(_) | ResultsError::Configuration(_))) => {
                tracing::warn!(student = %student.id, error = %e, "student not computed");
                errors.push(StudentIssue {
                    student: student.id.clone(),
                    reason: e.reason().to_string(),
                    message: e.to_string(),
                    subjects: Vec::new(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    cancel.check()?;

    rank_scope(&mut drafts, cfg.decimal_places);

    let prior_by_student: HashMap<&str, &PriorRow> =
        prior.iter().map(|p| (p.student_id.as_str(), p)).collect();
    let teacher_remarks = prior_teacher_remarks(&tx, &prior)?;

    // Artifacts of students that no longer produce a result go with their rows.
    let rebuilt: std::collections::HashSet<&str> =
        drafts.iter().map(|d| d.student_id.as_str()).collect();
    let mut orphaned_paths: Vec<String> = Vec::new();
    for p in &prior {
        if rebuilt.contains(p.student_id.as_str()) {
            tx.execute(
                "UPDATE report_artifacts SET stale = 1 WHERE term_result_id = ?",
                [&p.id],
            )?;
        } else {
            let path: Option<String> = tx
                .query_row(
                    "SELECT storage_path FROM report_artifacts WHERE term_result_id = ?",
                    [&p.id],
                    |r| r.get(0),
                )
                .optional()?;
            orphaned_paths.extend(path);
            tx.execute("DELETE FROM report_artifacts WHERE term_result_id = ?", [&p.id])?;
        }
        tx.execute("DELETE FROM term_results WHERE id = ?", [&p.id])?;
    }

    let computed_at = now_ts();
    let computed_by = req.actor.attribution();
    let total_students = drafts.len() as i64;
    {
        let mut insert_term = tx.prepare(
            "INSERT INTO term_results(
                id, student_id, classroom_id, term, academic_year, grade_scale_id,
                total_marks, total_possible, average_percentage, overall_grade, gpa,
                rank_in_class, total_students, remarks, flagged, is_published, published_at,
                computed_by, computed_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        let mut insert_subject = tx.prepare(
            "INSERT INTO subject_results(
                id, term_result_id, subject_id, ca_score, ca_max, exam_score, exam_max,
                total_score, total_possible, percentage, grade, point, rank_in_subject,
                class_average, highest, lowest, teacher_remarks, marks_missing)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for d in &drafts {
            cancel.check()?;
            let prev = prior_by_student.get(d.student_id.as_str());
            // Keep the row identity so attached artifacts survive the rebuild.
            let term_result_id = prev
                .map(|p| p.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let values: Vec<Value> = vec![
                Value::Text(term_result_id.clone()),
                Value::Text(d.student_id.clone()),
                Value::Text(scope.classroom_id.clone()),
                Value::Text(scope.term.clone()),
                Value::Text(scope.academic_year.clone()),
                Value::Text(scale.id.clone()),
                Value::Real(d.total_marks),
                Value::Real(d.total_possible),
                Value::Real(d.average_percentage),
                Value::Text(d.overall_grade.clone()),
                Value::Real(d.gpa),
                Value::Integer(d.rank_in_class as i64),
                Value::Integer(total_students),
                prev.and_then(|p| p.remarks.clone())
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                Value::Integer(d.flagged as i64),
                Value::Integer(prev.map(|p| p.is_published).unwrap_or(false) as i64),
                prev.and_then(|p| p.published_at.clone())
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                Value::Text(computed_by.to_string()),
                Value::Text(computed_at.clone()),
            ];
            insert_term.execute(params_from_iter(values))?;

            for s in &d.subjects {
                let remark = teacher_remarks
                    .get(&(d.student_id.clone(), s.subject_id.clone()))
                    .cloned()
                    .map(Value::Text)
                    .unwrap_or(Value::Null);
                let values: Vec<Value> = vec![
                    Value::Text(Uuid::new_v4().to_string()),
                    Value::Text(term_result_id.clone()),
                    Value::Text(s.subject_id.clone()),
                    Value::Real(s.ca_score),
                    Value::Real(s.ca_max),
                    Value::Real(s.exam_score),
                    Value::Real(s.exam_max),
                    Value::Real(s.total_score),
                    Value::Real(s.total_possible),
                    Value::Real(s.percentage),
                    Value::Text(s.grade.clone()),
                    Value::Real(s.point),
                    Value::Integer(s.rank_in_subject as i64),
                    Value::Real(s.class_average),
                    Value::Real(s.highest),
                    Value::Real(s.lowest),
                    remark,
                    Value::Integer(s.marks_missing as i64),
                ];
                insert_subject.execute(params_from_iter(values))?;
            }
        }
    }
    tx.commit()?;

    for path in orphaned_paths {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(path = %path, error = %e, "could not remove orphaned artifact file");
        }
    }

    let summary = ComputeSummary {
        scope: scope.clone(),
        grade_scale_id: scale.id.clone(),
        recomputed: !prior.is_empty(),
        total: students.len(),
        computed: drafts.len(),
        failed: errors.len(),
        flagged,
        errors,
    };
    tracing::info!(
        scope = %scope,
        total = summary.total,
        computed = summary.computed,
        failed = summary.failed,
        flagged = summary.flagged.len(),
        "results computed"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAction {
    Publish,
    Unpublish,
}

impl PublishAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(Self::Publish),
            "unpublish" => Some(Self::Unpublish),
            _ => None,
        }
    }
}

/// Flips visibility of every result in the scope. Scores are never touched.
pub fn publish(ctx: &ResultsContext<'_>, scope: &Scope, action: PublishAction) -> Result<usize> {
    let _guard = ctx.locks.acquire(scope)?;
    let updated = match action {
        PublishAction::Publish => ctx.conn.execute(
            "UPDATE term_results
             SET published_at = CASE WHEN is_published = 1 THEN published_at ELSE ? END,
                 is_published = 1
             WHERE classroom_id = ? AND term = ? AND academic_year = ?",
            (now_ts(), &scope.classroom_id, &scope.term, &scope.academic_year),
        )?,
        PublishAction::Unpublish => ctx.conn.execute(
            "UPDATE term_results
             SET is_published = 0, published_at = NULL
             WHERE classroom_id = ? AND term = ? AND academic_year = ?",
            (&scope.classroom_id, &scope.term, &scope.academic_year),
        )?,
    };
    tracing::info!(scope = %scope, ?action, updated, "publish state changed");
    Ok(updated)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TermResultView {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub admission_no: Option<String>,
    pub classroom_id: String,
    pub term: String,
    pub academic_year: String,
    pub grade_scale_id: String,
    pub total_marks: f64,
    pub total_possible: f64,
    pub average_percentage: f64,
    pub overall_grade: String,
    pub gpa: f64,
    pub rank_in_class: i64,
    pub total_students: i64,
    pub remarks: Option<String>,
    pub flagged: bool,
    pub is_published: bool,
    pub published_at: Option<String>,
    pub computed_by: String,
    pub computed_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResultView {
    pub id: String,
    pub term_result_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_code: Option<String>,
    pub ca_score: f64,
    pub ca_max: f64,
    pub exam_score: f64,
    pub exam_max: f64,
    pub total_score: f64,
    pub total_possible: f64,
    pub percentage: f64,
    pub grade: String,
    pub point: f64,
    pub rank_in_subject: i64,
    pub class_average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub teacher_remarks: Option<String>,
    pub marks_missing: bool,
}

const TERM_RESULT_SELECT: &str = "SELECT tr.id, tr.student_id, s.display_name, s.admission_no,
        tr.classroom_id, tr.term, tr.academic_year, tr.grade_scale_id, tr.total_marks,
        tr.total_possible, tr.average_percentage, tr.overall_grade, tr.gpa, tr.rank_in_class,
        tr.total_students, tr.remarks, tr.flagged, tr.is_published, tr.published_at,
        tr.computed_by, tr.computed_at
     FROM term_results tr
     JOIN students s ON s.id = tr.student_id";

fn term_result_from_row(r: &Row<'_>) -> rusqlite::Result<TermResultView> {
    Ok(TermResultView {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        admission_no: r.get(3)?,
        classroom_id: r.get(4)?,
        term: r.get(5)?,
        academic_year: r.get(6)?,
        grade_scale_id: r.get(7)?,
        total_marks: r.get(8)?,
        total_possible: r.get(9)?,
        average_percentage: r.get(10)?,
        overall_grade: r.get(11)?,
        gpa: r.get(12)?,
        rank_in_class: r.get(13)?,
        total_students: r.get(14)?,
        remarks: r.get(15)?,
        flagged: r.get::<_, i64>(16)? != 0,
        is_published: r.get::<_, i64>(17)? != 0,
        published_at: r.get(18)?,
        computed_by: r.get(19)?,
        computed_at: r.get(20)?,
    })
}

/// The publish gate: non-privileged callers only see published rows.
fn visibility_clause(actor: &Actor) -> &'static str {
    if actor.privileged {
        ""
    } else {
        " AND tr.is_published = 1"
    }
}

pub fn list_term_results(conn: &Connection, scope: &Scope, actor: &Actor) -> Result<Vec<TermResultView>> {
    let sql = format!(
        "{} WHERE tr.classroom_id = ? AND tr.term = ? AND tr.academic_year = ?{}
         ORDER BY tr.rank_in_class, tr.student_id",
        TERM_RESULT_SELECT,
        visibility_clause(actor)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (&scope.classroom_id, &scope.term, &scope.academic_year),
            term_result_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn term_results_for_student(
    conn: &Connection,
    student_id: &str,
    term: Option<&str>,
    academic_year: Option<&str>,
    actor: &Actor,
) -> Result<Vec<TermResultView>> {
    let mut sql = format!("{} WHERE tr.student_id = ?", TERM_RESULT_SELECT);
    let mut binds = vec![Value::Text(student_id.to_string())];
    if let Some(t) = term {
        sql.push_str(" AND tr.term = ?");
        binds.push(Value::Text(t.to_string()));
    }
    if let Some(y) = academic_year {
        sql.push_str(" AND tr.academic_year = ?");
        binds.push(Value::Text(y.to_string()));
    }
    sql.push_str(visibility_clause(actor));
    sql.push_str(" ORDER BY tr.academic_year, tr.term");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), term_result_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_term_result(conn: &Connection, term_result_id: &str, actor: &Actor) -> Result<TermResultView> {
    let sql = format!("{} WHERE tr.id = ?{}", TERM_RESULT_SELECT, visibility_clause(actor));
    conn.query_row(&sql, [term_result_id], term_result_from_row)
        .optional()?
        .ok_or_else(|| ResultsError::NotFound(format!("term result {}", term_result_id)))
}

pub fn subject_results(conn: &Connection, term_result_id: &str, actor: &Actor) -> Result<Vec<SubjectResultView>> {
    // Visibility follows the parent term result.
    get_term_result(conn, term_result_id, actor)?;
    let mut stmt = conn.prepare(
        "SELECT sr.id, sr.term_result_id, sr.subject_id, sub.name, sub.code,
                sr.ca_score, sr.ca_max, sr.exam_score, sr.exam_max, sr.total_score,
                sr.total_possible, sr.percentage, sr.grade, sr.point, sr.rank_in_subject,
                sr.class_average, sr.highest, sr.lowest, sr.teacher_remarks, sr.marks_missing
         FROM subject_results sr
         JOIN subjects sub ON sub.id = sr.subject_id
         WHERE sr.term_result_id = ?
         ORDER BY sub.sort_order, sub.name, sub.id",
    )?;
    let rows = stmt
        .query_map([term_result_id], |r| {
            Ok(SubjectResultView {
                id: r.get(0)?,
                term_result_id: r.get(1)?,
                subject_id: r.get(2)?,
                subject_name: r.get(3)?,
                subject_code: r.get(4)?,
                ca_score: r.get(5)?,
                ca_max: r.get(6)?,
                exam_score: r.get(7)?,
                exam_max: r.get(8)?,
                total_score: r.get(9)?,
                total_possible: r.get(10)?,
                percentage: r.get(11)?,
                grade: r.get(12)?,
                point: r.get(13)?,
                rank_in_subject: r.get(14)?,
                class_average: r.get(15)?,
                highest: r.get(16)?,
                lowest: r.get(17)?,
                teacher_remarks: r.get(18)?,
                marks_missing: r.get::<_, i64>(19)? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub subject_id: String,
    pub subject_name: String,
    pub student_count: i64,
    pub class_average: f64,
    pub highest: f64,
    pub lowest: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub scope: Scope,
    pub student_count: usize,
    pub class_average: f64,
    pub grade_distribution: BTreeMap<String, usize>,
    pub subjects: Vec<SubjectSummary>,
}

/// Per-subject statistics and overall grade counts over the rows the actor
/// may see.
pub fn class_summary(conn: &Connection, scope: &Scope, actor: &Actor) -> Result<ClassSummary> {
    let rows = list_term_results(conn, scope, actor)?;
    let dp = ComputationConfig::load(conn)?.decimal_places;
    let mut grade_distribution: BTreeMap<String, usize> = BTreeMap::new();
    for r in &rows {
        *grade_distribution.entry(r.overall_grade.clone()).or_insert(0) += 1;
    }
    let averages: Vec<f64> = rows.iter().map(|r| r.average_percentage).collect();

    let sql = format!(
        "SELECT sr.subject_id, sub.name, COUNT(*), MAX(sr.class_average), MAX(sr.highest), MIN(sr.lowest)
         FROM subject_results sr
         JOIN term_results tr ON tr.id = sr.term_result_id
         JOIN subjects sub ON sub.id = sr.subject_id
         WHERE tr.classroom_id = ? AND tr.term = ? AND tr.academic_year = ?{}
         GROUP BY sr.subject_id, sub.name
         ORDER BY MIN(sub.sort_order), sub.name",
        visibility_clause(actor)
    );
    let mut stmt = conn.prepare(&sql)?;
    let subjects = stmt
        .query_map((&scope.classroom_id, &scope.term, &scope.academic_year), |r| {
            Ok(SubjectSummary {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                student_count: r.get(2)?,
                class_average: r.get(3)?,
                highest: r.get(4)?,
                lowest: r.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ClassSummary {
        scope: scope.clone(),
        student_count: rows.len(),
        class_average: round_to(class_statistics(&averages).average, dp),
        grade_distribution,
        subjects,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemarkTarget<'a> {
    TermResult(&'a str),
    SubjectResult(&'a str),
}

/// The only in-place edit results allow: free-text remarks.
pub fn update_remarks(conn: &Connection, target: RemarkTarget<'_>, remarks: Option<&str>) -> Result<()> {
    let cleaned = remarks.map(str::trim).filter(|s| !s.is_empty());
    if let Some(text) = cleaned {
        if text.chars().count() > MAX_REMARK_CHARS {
            return Err(ResultsError::BadParams(format!(
                "remarks must be at most {} characters",
                MAX_REMARK_CHARS
            )));
        }
    }
    let (sql, id) = match target {
        RemarkTarget::TermResult(id) => ("UPDATE term_results SET remarks = ? WHERE id = ?", id),
        RemarkTarget::SubjectResult(id) => {
            ("UPDATE subject_results SET teacher_remarks = ? WHERE id = ?", id)
        }
    };
    let changed = conn.execute(sql, (cleaned, id))?;
    if changed == 0 {
        return Err(ResultsError::NotFound(format!("result {}", id)));
    }
    Ok(())
}
