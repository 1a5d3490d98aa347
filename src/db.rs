use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE: &str = "results.sqlite3";
pub const ARTIFACTS_DIR: &str = "artifacts";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    std::fs::create_dir_all(artifacts_dir(workspace))?;
    let conn = Connection::open(workspace.join(DB_FILE))?;
    // Background jobs hold their own connection; wait instead of failing on SQLITE_BUSY.
    conn.busy_timeout(Duration::from_secs(10))?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Starts a write transaction that takes the RESERVED lock up front, so a
/// pass that reads before it writes waits on `busy_timeout` instead of
/// failing on the lock upgrade when another connection is writing.
pub fn begin_write(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

pub fn artifacts_dir(workspace: &Path) -> PathBuf {
    workspace.join(ARTIFACTS_DIR)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scale_rules(
            id TEXT PRIMARY KEY,
            scale_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            lower_bound REAL NOT NULL,
            upper_bound REAL NOT NULL,
            letter TEXT NOT NULL,
            point REAL NOT NULL,
            remark TEXT,
            FOREIGN KEY(scale_id) REFERENCES grade_scales(id),
            UNIQUE(scale_id, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_scale_rules_scale ON grade_scale_rules(scale_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT,
            credit_units REAL NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            admission_no TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            classroom_id TEXT NOT NULL,
            term TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(classroom_id, term, academic_year, student_id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scope_subjects(
            classroom_id TEXT NOT NULL,
            term TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(classroom_id, term, academic_year, subject_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS mark_entries(
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            ca_score REAL NOT NULL,
            ca_max REAL NOT NULL,
            exam_score REAL NOT NULL,
            exam_max REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(student_id, subject_id, term, academic_year),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            term TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            grade_scale_id TEXT NOT NULL,
            total_marks REAL NOT NULL,
            total_possible REAL NOT NULL,
            average_percentage REAL NOT NULL,
            overall_grade TEXT NOT NULL,
            gpa REAL NOT NULL,
            rank_in_class INTEGER NOT NULL,
            total_students INTEGER NOT NULL,
            remarks TEXT,
            flagged INTEGER NOT NULL DEFAULT 0,
            is_published INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            computed_by TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(grade_scale_id) REFERENCES grade_scales(id),
            UNIQUE(student_id, term, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_results_scope
         ON term_results(classroom_id, term, academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_results(
            id TEXT PRIMARY KEY,
            term_result_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            ca_score REAL NOT NULL,
            ca_max REAL NOT NULL,
            exam_score REAL NOT NULL,
            exam_max REAL NOT NULL,
            total_score REAL NOT NULL,
            total_possible REAL NOT NULL,
            percentage REAL NOT NULL,
            grade TEXT NOT NULL,
            point REAL NOT NULL,
            rank_in_subject INTEGER NOT NULL,
            class_average REAL NOT NULL,
            highest REAL NOT NULL,
            lowest REAL NOT NULL,
            teacher_remarks TEXT,
            marks_missing INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(term_result_id) REFERENCES term_results(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(term_result_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_results_term_result
         ON subject_results(term_result_id)",
        [],
    )?;

    // Rebuilds delete and re-insert term_results under the same id inside one
    // transaction, so the artifact reference is only checked at commit.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_artifacts(
            id TEXT PRIMARY KEY,
            term_result_id TEXT NOT NULL UNIQUE,
            storage_path TEXT NOT NULL,
            content_type TEXT NOT NULL,
            content_sha256 TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            generated_by TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            download_count INTEGER NOT NULL DEFAULT 0,
            last_downloaded_at TEXT,
            stale INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(term_result_id) REFERENCES term_results(id) DEFERRABLE INITIALLY DEFERRED
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("corrupt setting {}", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&conn).expect("init schema");
    conn
}
