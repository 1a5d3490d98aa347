use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{ComponentWeighting, ComputationConfig};
use crate::db::{self, now_ts};
use crate::error::{Result, ResultsError};
use crate::grading::percentage;
use crate::scope::Scope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolledStudent {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub admission_no: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default = "default_credit_units")]
    pub credit_units: f64,
    #[serde(default)]
    pub sort_order: i64,
}

fn default_credit_units() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MarkEntry {
    ca_score: f64,
    ca_max: f64,
    exam_score: f64,
    exam_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkEntryInput {
    pub student_id: String,
    pub subject_id: String,
    pub ca_score: f64,
    pub ca_max: f64,
    pub exam_score: f64,
    pub exam_max: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawMarks {
    pub subject_id: String,
    pub ca_score: f64,
    pub ca_max: f64,
    pub exam_score: f64,
    pub exam_max: f64,
}

/// Enrollment collaborator.
pub trait Roster {
    fn enrolled(&self, scope: &Scope) -> Result<Vec<EnrolledStudent>>;
}

/// Marks collaborator: the subjects offered to a scope and the CA/exam
/// entries recorded for a student.
pub trait MarkSource {
    fn subjects_for(&self, scope: &Scope) -> Result<Vec<Subject>>;
    fn marks_for(&self, scope: &Scope, student_id: &str) -> Result<Vec<RawMarks>>;
}

pub struct SqliteSources<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSources<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl Roster for SqliteSources<'_> {
    fn enrolled(&self, scope: &Scope) -> Result<Vec<EnrolledStudent>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.display_name, s.admission_no
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.classroom_id = ? AND e.term = ? AND e.academic_year = ?
             ORDER BY s.id",
        )?;
        let rows = stmt
            .query_map(
                (&scope.classroom_id, &scope.term, &scope.academic_year),
                |r| {
                    Ok(EnrolledStudent {
                        id: r.get(0)?,
                        display_name: r.get(1)?,
                        admission_no: r.get(2)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl MarkSource for SqliteSources<'_> {
    fn subjects_for(&self, scope: &Scope) -> Result<Vec<Subject>> {
        let mut stmt = self.conn.prepare(
            "SELECT sub.id, sub.name, sub.code, sub.credit_units, sub.sort_order
             FROM scope_subjects ss
             JOIN subjects sub ON sub.id = ss.subject_id
             WHERE ss.classroom_id = ? AND ss.term = ? AND ss.academic_year = ?
             ORDER BY sub.sort_order, sub.name, sub.id",
        )?;
        let rows = stmt
            .query_map(
                (&scope.classroom_id, &scope.term, &scope.academic_year),
                |r| {
                    Ok(Subject {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        code: r.get(2)?,
                        credit_units: r.get(3)?,
                        sort_order: r.get(4)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn marks_for(&self, scope: &Scope, student_id: &str) -> Result<Vec<RawMarks>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject_id, ca_score, ca_max, exam_score, exam_max
             FROM mark_entries
             WHERE student_id = ? AND term = ? AND academic_year = ?",
        )?;
        let rows = stmt
            .query_map((student_id, &scope.term, &scope.academic_year), |r| {
                Ok(RawMarks {
                    subject_id: r.get(0)?,
                    ca_score: r.get(1)?,
                    ca_max: r.get(2)?,
                    exam_score: r.get(3)?,
                    exam_max: r.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// One subject's marks after applying the component weighting.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedSubject {
    pub subject: Subject,
    pub ca_score: f64,
    pub ca_max: f64,
    pub exam_score: f64,
    pub exam_max: f64,
    pub total_score: f64,
    pub total_possible: f64,
    pub marks_missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentMarks {
    pub subjects: Vec<AggregatedSubject>,
    pub missing_subjects: Vec<String>,
}

fn combine(entry: MarkEntry, weighting: ComponentWeighting) -> (f64, f64) {
    match weighting {
        ComponentWeighting::Raw => (
            entry.ca_score + entry.exam_score,
            entry.ca_max + entry.exam_max,
        ),
        ComponentWeighting::Weighted {
            ca_weight,
            exam_weight,
        } => {
            let ca = percentage(entry.ca_score, entry.ca_max) * ca_weight / 100.0;
            let exam = percentage(entry.exam_score, entry.exam_max) * exam_weight / 100.0;
            (ca + exam, 100.0)
        }
    }
}

/// Collects one student's marks for every subject offered to the scope.
/// Subjects without an entry count as zero and are reported as missing; a
/// student with no entries at all is a `SourceDataMissing` failure.
pub fn aggregate_student(
    source: &dyn MarkSource,
    scope: &Scope,
    subjects: &[Subject],
    student_id: &str,
    cfg: &ComputationConfig,
) -> Result<StudentMarks> {
    let raw = source.marks_for(scope, student_id)?;
    let by_subject: HashMap<&str, &RawMarks> =
        raw.iter().map(|m| (m.subject_id.as_str(), m)).collect();

    if subjects.iter().all(|s| !by_subject.contains_key(s.id.as_str())) {
        return Err(ResultsError::SourceDataMissing(format!(
            "no marks recorded for student {} in {}",
            student_id, scope
        )));
    }

    let mut out = Vec::with_capacity(subjects.len());
    let mut missing_subjects = Vec::new();
    for subject in subjects {
        let (entry, marks_missing) = match by_subject.get(subject.id.as_str()) {
            Some(m) => (
                MarkEntry {
                    ca_score: m.ca_score,
                    ca_max: m.ca_max,
                    exam_score: m.exam_score,
                    exam_max: m.exam_max,
                },
                false,
            ),
            None => {
                missing_subjects.push(subject.id.clone());
                (
                    MarkEntry {
                        ca_score: 0.0,
                        ca_max: cfg.default_ca_max,
                        exam_score: 0.0,
                        exam_max: cfg.default_exam_max,
                    },
                    true,
                )
            }
        };
        let (total_score, total_possible) = combine(entry, cfg.weighting);
        out.push(AggregatedSubject {
            subject: subject.clone(),
            ca_score: entry.ca_score,
            ca_max: entry.ca_max,
            exam_score: entry.exam_score,
            exam_max: entry.exam_max,
            total_score,
            total_possible,
            marks_missing,
        });
    }
    Ok(StudentMarks {
        subjects: out,
        missing_subjects,
    })
}

pub fn upsert_subjects(conn: &Connection, subjects: &[Subject]) -> Result<usize> {
    let tx = db::begin_write(conn)?;
    for s in subjects {
        if s.id.trim().is_empty() || s.name.trim().is_empty() {
            return Err(ResultsError::BadParams("subject id and name are required".into()));
        }
        if !(s.credit_units.is_finite() && s.credit_units > 0.0) {
            return Err(ResultsError::BadParams(format!(
                "subject {} creditUnits must be > 0",
                s.id
            )));
        }
        tx.execute(
            "INSERT INTO subjects(id, name, code, credit_units, sort_order) VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                code = excluded.code,
                credit_units = excluded.credit_units,
                sort_order = excluded.sort_order",
            (&s.id, s.name.trim(), &s.code, s.credit_units, s.sort_order),
        )?;
    }
    tx.commit()?;
    Ok(subjects.len())
}

/// Replaces the enrollment and subject offering of one scope.
pub fn set_roster(
    conn: &Connection,
    scope: &Scope,
    students: &[EnrolledStudent],
    subject_ids: &[String],
) -> Result<()> {
    let tx = db::begin_write(conn)?;
    for sid in subject_ids {
        let known = tx
            .query_row("SELECT 1 FROM subjects WHERE id = ?", [sid], |r| r.get::<_, i64>(0))
            .optional()?
            .is_some();
        if !known {
            return Err(ResultsError::BadParams(format!("unknown subject {}", sid)));
        }
    }
    let scope_params = (&scope.classroom_id, &scope.term, &scope.academic_year);
    tx.execute(
        "DELETE FROM enrollments WHERE classroom_id = ? AND term = ? AND academic_year = ?",
        scope_params,
    )?;
    tx.execute(
        "DELETE FROM scope_subjects WHERE classroom_id = ? AND term = ? AND academic_year = ?",
        scope_params,
    )?;
    for s in students {
        if s.id.trim().is_empty() {
            return Err(ResultsError::BadParams("student id is required".into()));
        }
        tx.execute(
            "INSERT INTO students(id, display_name, admission_no) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                admission_no = excluded.admission_no",
            (&s.id, s.display_name.trim(), &s.admission_no),
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO enrollments(classroom_id, term, academic_year, student_id)
             VALUES(?, ?, ?, ?)",
            (&scope.classroom_id, &scope.term, &scope.academic_year, &s.id),
        )?;
    }
    for sid in subject_ids {
        tx.execute(
            "INSERT OR IGNORE INTO scope_subjects(classroom_id, term, academic_year, subject_id)
             VALUES(?, ?, ?, ?)",
            (&scope.classroom_id, &scope.term, &scope.academic_year, sid),
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn validate_entry(e: &MarkEntryInput) -> Result<()> {
    let nums = [e.ca_score, e.ca_max, e.exam_score, e.exam_max];
    if nums.iter().any(|n| !n.is_finite()) {
        return Err(ResultsError::BadParams(format!(
            "marks for {}/{} must be numbers",
            e.student_id, e.subject_id
        )));
    }
    if e.ca_max <= 0.0 || e.exam_max <= 0.0 {
        return Err(ResultsError::BadParams(format!(
            "maxima for {}/{} must be > 0",
            e.student_id, e.subject_id
        )));
    }
    if e.ca_score < 0.0 || e.exam_score < 0.0 || e.ca_score > e.ca_max || e.exam_score > e.exam_max {
        return Err(ResultsError::BadParams(format!(
            "scores for {}/{} must be within 0..=max",
            e.student_id, e.subject_id
        )));
    }
    Ok(())
}

/// Batch upsert of mark entries for one term; the whole batch is rejected if
/// any entry is invalid.
pub fn upsert_marks(
    conn: &Connection,
    term: &str,
    academic_year: &str,
    entries: &[MarkEntryInput],
) -> Result<usize> {
    for e in entries {
        validate_entry(e)?;
    }
    let tx = db::begin_write(conn)?;
    let now = now_ts();
    for e in entries {
        let res = tx.execute(
            "INSERT INTO mark_entries(student_id, subject_id, term, academic_year, ca_score, ca_max, exam_score, exam_max, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_id, term, academic_year) DO UPDATE SET
                ca_score = excluded.ca_score,
                ca_max = excluded.ca_max,
                exam_score = excluded.exam_score,
                exam_max = excluded.exam_max,
                updated_at = excluded.updated_at",
            (
                &e.student_id,
                &e.subject_id,
                term,
                academic_year,
                e.ca_score,
                e.ca_max,
                e.exam_score,
                e.exam_max,
                &now,
            ),
        );
        match res {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(f, _))
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(ResultsError::BadParams(format!(
                    "unknown student {} or subject {}",
                    e.student_id, e.subject_id
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    tx.commit()?;
    Ok(entries.len())
}
