use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{ComputationConfig, ReportConfig, SchoolIdentity};
use crate::db::{self, now_ts};
use crate::error::{Result, ResultsError};
use crate::locks::CancelFlag;
use crate::render::{self, ReportInput, TemplateData, CONTENT_TYPE, DEFAULT_TEMPLATE};
use crate::results::{self, StudentIssue};
use crate::scope::{Actor, Scope};
use crate::sources::{Roster, SqliteSources};

const MANIFEST_ENTRY: &str = "manifest.json";
pub const BUNDLE_FORMAT: &str = "resultsd-report-bundle-v1";

#[derive(Debug, Clone, Copy)]
pub struct ArtifactContext<'a> {
    pub conn: &'a Connection,
    pub workspace: &'a Path,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportArtifact {
    pub id: String,
    pub term_result_id: String,
    pub student_id: String,
    pub content_type: String,
    pub content_sha256: String,
    pub byte_size: i64,
    pub generated_by: String,
    pub generated_at: String,
    pub download_count: i64,
    pub last_downloaded_at: Option<String>,
    pub stale: bool,
    #[serde(skip)]
    pub storage_path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOutcome {
    pub artifact: ReportArtifact,
    /// False when an existing artifact was returned untouched.
    pub generated: bool,
}

const ARTIFACT_SELECT: &str = "SELECT a.id, a.term_result_id, tr.student_id, a.content_type,
        a.content_sha256, a.byte_size, a.generated_by, a.generated_at, a.download_count,
        a.last_downloaded_at, a.stale, a.storage_path
     FROM report_artifacts a
     JOIN term_results tr ON tr.id = a.term_result_id";

fn artifact_from_row(r: &Row<'_>) -> rusqlite::Result<ReportArtifact> {
    Ok(ReportArtifact {
        id: r.get(0)?,
        term_result_id: r.get(1)?,
        student_id: r.get(2)?,
        content_type: r.get(3)?,
        content_sha256: r.get(4)?,
        byte_size: r.get(5)?,
        generated_by: r.get(6)?,
        generated_at: r.get(7)?,
        download_count: r.get(8)?,
        last_downloaded_at: r.get(9)?,
        stale: r.get::<_, i64>(10)? != 0,
        storage_path: r.get(11)?,
    })
}

fn artifact_for_term_result(conn: &Connection, term_result_id: &str) -> Result<Option<ReportArtifact>> {
    let sql = format!("{} WHERE a.term_result_id = ?", ARTIFACT_SELECT);
    Ok(conn
        .query_row(&sql, [term_result_id], artifact_from_row)
        .optional()?)
}

fn artifact_by_id(conn: &Connection, artifact_id: &str) -> Result<Option<ReportArtifact>> {
    let sql = format!("{} WHERE a.id = ?", ARTIFACT_SELECT);
    Ok(conn.query_row(&sql, [artifact_id], artifact_from_row).optional()?)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Writes the document next to its final path. The caller moves it into
/// place once the artifact row is recorded.
fn stage_document(path: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let tmp = path.with_extension("html.writing");
    let mut f = File::create(&tmp)
        .with_context(|| format!("failed to create {}", tmp.to_string_lossy()))?;
    f.write_all(bytes)
        .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
    f.sync_all().context("failed to flush report document")?;
    Ok(tmp)
}

struct StoredDocument<'a> {
    artifact_id: &'a str,
    term_result_id: &'a str,
    path: &'a Path,
    sha: &'a str,
    byte_size: i64,
    generated_by: &'a str,
}

/// Records the artifact row and renames the staged file over the stored
/// document inside one transaction. The old document stays in place unless
/// the row was written.
fn store_document(conn: &Connection, doc: &StoredDocument<'_>, replace: bool, staged: &Path) -> Result<()> {
    let storage_path = doc.path.to_string_lossy().to_string();
    let generated_at = now_ts();
    let tx = db::begin_write(conn)?;
    if replace {
        tx.execute(
            "UPDATE report_artifacts
             SET storage_path = ?, content_type = ?, content_sha256 = ?, byte_size = ?,
                 generated_by = ?, generated_at = ?, stale = 0
             WHERE id = ?",
            (
                &storage_path,
                CONTENT_TYPE,
                doc.sha,
                doc.byte_size,
                doc.generated_by,
                &generated_at,
                doc.artifact_id,
            ),
        )?;
    } else {
        tx.execute(
            "INSERT INTO report_artifacts(
                id, term_result_id, storage_path, content_type, content_sha256, byte_size,
                generated_by, generated_at, download_count, last_downloaded_at, stale)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, 0)",
            (
                doc.artifact_id,
                doc.term_result_id,
                &storage_path,
                CONTENT_TYPE,
                doc.sha,
                doc.byte_size,
                doc.generated_by,
                &generated_at,
            ),
        )?;
    }
    std::fs::rename(staged, doc.path)?;
    if let Err(e) = tx.commit() {
        if !replace {
            let _ = std::fs::remove_file(doc.path);
        }
        return Err(e.into());
    }
    Ok(())
}

fn io_error(e: anyhow::Error) -> ResultsError {
    ResultsError::Io(std::io::Error::other(format!("{e:#}")))
}

fn render_document(conn: &Connection, term_result_id: &str) -> Result<Vec<u8>> {
    let system = Actor::system();
    let term_result = results::get_term_result(conn, term_result_id, &system)?;
    let subjects = results::subject_results(conn, term_result_id, &system)?;
    let report_cfg = ReportConfig::load(conn)?;
    let input = ReportInput {
        school: SchoolIdentity::load(conn)?,
        term_result,
        subjects,
        show_positions: report_cfg.show_positions,
        show_class_statistics: report_cfg.show_class_statistics,
        decimal_places: ComputationConfig::load(conn)?.decimal_places,
        generated_at: now_ts(),
    };
    let template = report_cfg
        .template
        .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
    let data = TemplateData::from_report(&input);
    let html = render::run_with_timeout(report_cfg.render_timeout, move || {
        render::render(&template, &data)
    })?;
    Ok(html.into_bytes())
}

/// Produces the report document for one computed result. An existing
/// artifact is returned as-is unless `regenerate` is set, in which case the
/// document is replaced under the same artifact id and counters.
pub fn generate(
    ctx: &ArtifactContext<'_>,
    term_result_id: &str,
    regenerate: bool,
    actor: &Actor,
) -> Result<GenerateOutcome> {
    let conn = ctx.conn;
    let computed: Option<i64> = conn
        .query_row("SELECT 1 FROM term_results WHERE id = ?", [term_result_id], |r| r.get(0))
        .optional()?;
    if computed.is_none() {
        return Err(ResultsError::NotReady(format!(
            "term result {} has not been computed",
            term_result_id
        )));
    }

    let existing = artifact_for_term_result(conn, term_result_id)?;
    if let Some(artifact) = existing.as_ref() {
        if !regenerate {
            return Ok(GenerateOutcome {
                artifact: artifact.clone(),
                generated: false,
            });
        }
    }

    // Nothing on disk or in the table changes until rendering succeeded.
    let bytes = render_document(conn, term_result_id)?;
    let sha = sha256_hex(&bytes);
    let artifact_id = existing
        .as_ref()
        .map(|a| a.id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let path: PathBuf = db::artifacts_dir(ctx.workspace).join(format!("{}.html", artifact_id));
    let staged = stage_document(&path, &bytes).map_err(io_error)?;
    let doc = StoredDocument {
        artifact_id: &artifact_id,
        term_result_id,
        path: &path,
        sha: &sha,
        byte_size: bytes.len() as i64,
        generated_by: actor.attribution(),
    };
    if let Err(e) = store_document(conn, &doc, existing.is_some(), &staged) {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }

    tracing::info!(
        artifact_id = %artifact_id,
        term_result_id,
        bytes = bytes.len(),
        regenerated = regenerate,
        "report artifact generated"
    );
    let artifact = artifact_by_id(conn, &artifact_id)?
        .ok_or_else(|| ResultsError::NotFound(format!("artifact {}", artifact_id)))?;
    Ok(GenerateOutcome {
        artifact,
        generated: true,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BulkSummary {
    pub scope: Scope,
    pub total: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<StudentIssue>,
}

/// Generates reports for every enrolled student of the scope. A failure for
/// one student is recorded and the batch moves on; only cancellation stops it.
pub fn bulk_generate(
    ctx: &ArtifactContext<'_>,
    scope: &Scope,
    regenerate: bool,
    actor: &Actor,
    cancel: &CancelFlag,
) -> Result<BulkSummary> {
    let students = SqliteSources::new(ctx.conn).enrolled(scope)?;
    let mut summary = BulkSummary {
        scope: scope.clone(),
        total: students.len(),
        generated: 0,
        skipped: 0,
        failed: 0,
        errors: Vec::new(),
    };
    tracing::info!(scope = %scope, students = students.len(), regenerate, "bulk report generation");

    for student in &students {
        cancel.check()?;
        let term_result_id: Option<String> = ctx
            .conn
            .query_row(
                "SELECT id FROM term_results
                 WHERE student_id = ? AND classroom_id = ? AND term = ? AND academic_year = ?",
                (&student.id, &scope.classroom_id, &scope.term, &scope.academic_year),
                |r| r.get(0),
            )
            .optional()?;
        let outcome = match term_result_id {
            Some(id) => generate(ctx, &id, regenerate, actor),
            None => Err(ResultsError::NotReady(format!(
                "no computed result for student {} in {}",
                student.id, scope
            ))),
        };
        match outcome {
            Ok(o) if o.generated => summary.generated += 1,
            Ok(_) => summary.skipped += 1,
            Err(ResultsError::Cancelled) => return Err(ResultsError::Cancelled),
            Err(e) => {
                tracing::warn!(student = %student.id, error = %e, "report not generated");
                summary.failed += 1;
                summary.errors.push(StudentIssue {
                    student: student.id.clone(),
                    reason: e.reason().to_string(),
                    message: e.to_string(),
                    subjects: Vec::new(),
                });
            }
        }
    }
    tracing::info!(
        scope = %scope,
        generated = summary.generated,
        skipped = summary.skipped,
        failed = summary.failed,
        "bulk report generation finished"
    );
    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct Download {
    pub artifact: ReportArtifact,
    pub bytes: Vec<u8>,
}

/// Returns the stored document and bumps its download counter. Unpublished
/// results are invisible to non-privileged callers.
pub fn download(ctx: &ArtifactContext<'_>, artifact_id: &str, actor: &Actor) -> Result<Download> {
    let conn = ctx.conn;
    let artifact = artifact_by_id(conn, artifact_id)?
        .ok_or_else(|| ResultsError::NotFound(format!("artifact {}", artifact_id)))?;
    // Publish gate follows the owning result.
    results::get_term_result(conn, &artifact.term_result_id, actor)
        .map_err(|_| ResultsError::NotFound(format!("artifact {}", artifact_id)))?;

    let bytes = std::fs::read(&artifact.storage_path)?;
    conn.execute(
        "UPDATE report_artifacts
         SET download_count = download_count + 1, last_downloaded_at = ?
         WHERE id = ?",
        (now_ts(), artifact_id),
    )?;
    let artifact = artifact_by_id(conn, artifact_id)?
        .ok_or_else(|| ResultsError::NotFound(format!("artifact {}", artifact_id)))?;
    tracing::debug!(artifact_id, downloads = artifact.download_count, "artifact downloaded");
    Ok(Download { artifact, bytes })
}

pub fn list_artifacts(conn: &Connection, scope: &Scope) -> Result<Vec<ReportArtifact>> {
    let sql = format!(
        "{} WHERE tr.classroom_id = ? AND tr.term = ? AND tr.academic_year = ?
         ORDER BY tr.student_id",
        ARTIFACT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((&scope.classroom_id, &scope.term, &scope.academic_year), artifact_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    pub bundle_format: String,
    pub path: String,
    pub entry_count: usize,
}

/// Zips every artifact of the scope into one archive with a manifest.
pub fn export_bundle(conn: &Connection, scope: &Scope, out_path: &Path) -> Result<BundleSummary> {
    let artifacts = list_artifacts(conn, scope)?;
    write_bundle(scope, &artifacts, out_path).map_err(io_error)?;
    tracing::info!(scope = %scope, artifacts = artifacts.len(), path = %out_path.to_string_lossy(), "report bundle exported");
    Ok(BundleSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        path: out_path.to_string_lossy().to_string(),
        entry_count: artifacts.len() + 1,
    })
}

fn write_bundle(scope: &Scope, artifacts: &[ReportArtifact], out_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let entries: Vec<serde_json::Value> = artifacts
        .iter()
        .map(|a| {
            json!({
                "entry": format!("reports/{}.html", a.student_id),
                "artifactId": a.id,
                "termResultId": a.term_result_id,
                "studentId": a.student_id,
                "contentSha256": a.content_sha256,
                "generatedAt": a.generated_at,
                "stale": a.stale,
            })
        })
        .collect();
    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": now_ts(),
        "scope": scope,
        "artifacts": entries,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    for a in artifacts {
        zip.start_file(format!("reports/{}.html", a.student_id), opts)
            .with_context(|| format!("failed to start entry for {}", a.student_id))?;
        let mut doc = File::open(&a.storage_path)
            .with_context(|| format!("failed to open artifact {}", a.storage_path))?;
        std::io::copy(&mut doc, &mut zip)
            .with_context(|| format!("failed to write entry for {}", a.student_id))?;
    }
    zip.finish().context("failed to finalize zip bundle")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{update_section, SetupSection};
    use crate::locks::ScopeLocks;
    use crate::results::{compute, publish, ComputeRequest, PublishAction, ResultsContext};
    use crate::sources::{set_roster, upsert_marks, upsert_subjects, EnrolledStudent, MarkEntryInput, Subject};
    use std::io::Read;

    fn temp_workspace(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn scope() -> Scope {
        Scope::new("JSS3C", "Second Term", "2024/2025")
    }

    /// Enrolls `students`, records marks for all but `unmarked`, and computes.
    fn computed(conn: &Connection, students: usize, unmarked: &[usize]) {
        upsert_subjects(
            conn,
            &[Subject {
                id: "bio".into(),
                name: "Biology".into(),
                code: None,
                credit_units: 1.0,
                sort_order: 0,
            }],
        )
        .expect("subjects");
        let roster: Vec<EnrolledStudent> = (0..students)
            .map(|i| EnrolledStudent {
                id: format!("st{:02}", i),
                display_name: format!("Student {}", i),
                admission_no: None,
            })
            .collect();
        set_roster(conn, &scope(), &roster, &["bio".into()]).expect("roster");
        let entries: Vec<MarkEntryInput> = (0..students)
            .filter(|i| !unmarked.contains(i))
            .map(|i| MarkEntryInput {
                student_id: format!("st{:02}", i),
                subject_id: "bio".into(),
                ca_score: 20.0 + i as f64,
                ca_max: 40.0,
                exam_score: 30.0,
                exam_max: 60.0,
            })
            .collect();
        let s = scope();
        upsert_marks(conn, &s.term, &s.academic_year, &entries).expect("marks");
        let locks = ScopeLocks::default();
        let actor = Actor::staff("teacher");
        compute(
            &ResultsContext { conn, locks: &locks },
            &ComputeRequest {
                scope: &s,
                scale_id: None,
                recompute: false,
                actor: &actor,
            },
            &CancelFlag::default(),
        )
        .expect("compute");
    }

    fn first_term_result(conn: &Connection) -> String {
        conn.query_row(
            "SELECT id FROM term_results ORDER BY student_id LIMIT 1",
            [],
            |r| r.get(0),
        )
        .expect("term result")
    }

    #[test]
    fn generate_is_idempotent_until_regenerated() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-generate");
        computed(&conn, 2, &[]);
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        let staff = Actor::staff("teacher");
        let tr = first_term_result(&conn);

        let first = generate(&ctx, &tr, false, &staff).expect("generate");
        assert!(first.generated);
        assert_eq!(first.artifact.content_type, CONTENT_TYPE);
        assert_eq!(first.artifact.content_sha256.len(), 64);
        let body = std::fs::read_to_string(&first.artifact.storage_path).expect("doc");
        assert!(body.contains("Biology"));

        let again = generate(&ctx, &tr, false, &staff).expect("again");
        assert!(!again.generated);
        assert_eq!(again.artifact, first.artifact);

        download(&ctx, &first.artifact.id, &staff).expect("download");
        let regen = generate(&ctx, &tr, true, &staff).expect("regenerate");
        assert!(regen.generated);
        assert_eq!(regen.artifact.id, first.artifact.id);
        assert_eq!(regen.artifact.download_count, 1);
    }

    #[test]
    fn generate_for_unknown_result_is_not_ready() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-not-ready");
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        let res = generate(&ctx, "missing", false, &Actor::staff("t"));
        assert!(matches!(res, Err(ResultsError::NotReady(_))));
    }

    #[test]
    fn failed_render_keeps_the_previous_artifact() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-render-fail");
        computed(&conn, 1, &[]);
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        let staff = Actor::staff("t");
        let tr = first_term_result(&conn);
        let first = generate(&ctx, &tr, false, &staff).expect("generate");

        let patch = json!({ "template": "<p>{{unknownField}}</p>" });
        update_section(
            &conn,
            SetupSection::Reports,
            patch.as_object().expect("object"),
        )
        .expect("template");
        let res = generate(&ctx, &tr, true, &staff);
        assert!(matches!(res, Err(ResultsError::Render(_))));
        let kept = artifact_by_id(&conn, &first.artifact.id)
            .expect("query")
            .expect("artifact");
        assert_eq!(kept, first.artifact);
        let body = std::fs::read(&kept.storage_path).expect("doc");
        assert_eq!(sha256_hex(&body), kept.content_sha256);
    }

    #[test]
    fn failed_row_update_leaves_the_stored_document_untouched() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-update-fail");
        computed(&conn, 1, &[]);
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        let staff = Actor::staff("t");
        let tr = first_term_result(&conn);
        let first = generate(&ctx, &tr, false, &staff).expect("generate");
        let before = std::fs::read(&first.artifact.storage_path).expect("doc");

        // Change the rendered bytes, then make the row update fail.
        let patch = json!({ "template": "<p>{{studentName}} v2</p>" });
        update_section(
            &conn,
            SetupSection::Reports,
            patch.as_object().expect("object"),
        )
        .expect("template");
        conn.execute_batch(
            "CREATE TRIGGER block_artifact_update BEFORE UPDATE ON report_artifacts
             BEGIN SELECT RAISE(ABORT, 'artifact row is read-only'); END;",
        )
        .expect("trigger");

        let res = generate(&ctx, &tr, true, &staff);
        assert!(matches!(res, Err(ResultsError::Db(_))));
        let kept = artifact_by_id(&conn, &first.artifact.id)
            .expect("query")
            .expect("artifact");
        assert_eq!(kept, first.artifact);
        let after = std::fs::read(&kept.storage_path).expect("doc");
        assert_eq!(after, before);
        assert_eq!(sha256_hex(&after), kept.content_sha256);
        let staged = Path::new(&kept.storage_path).with_extension("html.writing");
        assert!(!staged.exists());
    }

    #[test]
    fn bulk_generate_reports_students_without_results() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-bulk");
        computed(&conn, 10, &[4]);
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        let summary = bulk_generate(&ctx, &scope(), false, &Actor::staff("t"), &CancelFlag::default())
            .expect("bulk");
        assert_eq!(summary.total, 10);
        assert_eq!(summary.generated, 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].student, "st04");
        assert_eq!(summary.errors[0].reason, "NotReady");

        let again = bulk_generate(&ctx, &scope(), false, &Actor::staff("t"), &CancelFlag::default())
            .expect("bulk again");
        assert_eq!(again.generated, 0);
        assert_eq!(again.skipped, 9);
        assert_eq!(list_artifacts(&conn, &scope()).expect("list").len(), 9);
    }

    #[test]
    fn bulk_generate_ignores_results_computed_under_another_classroom() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-bulk-moved");
        computed(&conn, 2, &[]);
        let s = scope();
        let other = Scope::new("JSS3D", &s.term, &s.academic_year);
        set_roster(
            &conn,
            &other,
            &[EnrolledStudent {
                id: "st00".into(),
                display_name: "Student 0".into(),
                admission_no: None,
            }],
            &["bio".into()],
        )
        .expect("roster");
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        let summary = bulk_generate(&ctx, &other, false, &Actor::staff("t"), &CancelFlag::default())
            .expect("bulk");
        assert_eq!(summary.total, 1);
        assert_eq!(summary.generated, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].reason, "NotReady");
        assert!(list_artifacts(&conn, &s).expect("list").is_empty());
    }

    #[test]
    fn download_counts_every_call_and_respects_publish_gate() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-download");
        computed(&conn, 1, &[]);
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        let staff = Actor::staff("t");
        let tr = first_term_result(&conn);
        let art = generate(&ctx, &tr, false, &staff).expect("generate").artifact;

        let public = Actor::default();
        assert!(matches!(
            download(&ctx, &art.id, &public),
            Err(ResultsError::NotFound(_))
        ));

        let d1 = download(&ctx, &art.id, &staff).expect("d1");
        let d2 = download(&ctx, &art.id, &staff).expect("d2");
        assert_eq!(d1.artifact.download_count, 1);
        assert_eq!(d2.artifact.download_count, 2);
        assert!(d2.artifact.last_downloaded_at >= d1.artifact.last_downloaded_at);
        assert!(d1.artifact.last_downloaded_at.is_some());
        assert_eq!(d1.bytes, d2.bytes);

        let locks = ScopeLocks::default();
        publish(
            &ResultsContext {
                conn: &conn,
                locks: &locks,
            },
            &scope(),
            PublishAction::Publish,
        )
        .expect("publish");
        assert_eq!(
            download(&ctx, &art.id, &public).expect("public").artifact.download_count,
            3
        );
    }

    #[test]
    fn bundle_contains_manifest_and_documents() {
        let conn = db::open_in_memory();
        let ws = temp_workspace("artifacts-bundle");
        computed(&conn, 3, &[]);
        let ctx = ArtifactContext {
            conn: &conn,
            workspace: &ws,
        };
        bulk_generate(&ctx, &scope(), false, &Actor::staff("t"), &CancelFlag::default()).expect("bulk");
        let out = ws.join("out").join("reports.zip");
        let summary = export_bundle(&conn, &scope(), &out).expect("export");
        assert_eq!(summary.entry_count, 4);

        let mut archive = zip::ZipArchive::new(File::open(&out).expect("open")).expect("zip");
        let mut manifest = String::new();
        archive
            .by_name(MANIFEST_ENTRY)
            .expect("manifest")
            .read_to_string(&mut manifest)
            .expect("read manifest");
        let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("json");
        assert_eq!(manifest["format"], BUNDLE_FORMAT);
        assert_eq!(manifest["artifacts"].as_array().map(|a| a.len()), Some(3));
        assert!(archive.by_name("reports/st01.html").is_ok());
    }
}
