
use base64::Engine;
use serde_json::json;
use std::io::Read;
use test_support::{request_err, request_ok, seed_scope, spawn_sidecar, staff, temp_dir, with_scope};

fn scope() -> serde_json::Value {
    json!({ "classroomId": "P6B", "term": "First Term", "academicYear": "2025/2026" })
}

#[test]
fn bulk_generate_over_ten_students_reports_the_one_not_ready() {
    let workspace = temp_dir("resultsd-bulk-generate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let scope = scope();
    // st07 never gets marks, so compute leaves it without a result.
    let marks: Vec<(usize, &str, f64, f64)> = (1..=10)
        .filter(|i| *i != 7)
        .map(|i| (i, "math", 15.0 + i as f64, 30.0 + i as f64))
        .collect();
    seed_scope(&mut stdin, &mut reader, &scope, &["math"], 10, &marks);
    let computed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.compute",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    assert_eq!(computed["computed"], 9);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.bulkGenerate",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    assert_eq!(summary["total"], 10);
    assert_eq!(summary["generated"], 9);
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["errors"][0]["student"], "st07");
    assert_eq!(summary["errors"][0]["reason"], "NotReady");

    // Re-running without regenerate leaves existing documents alone.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.bulkGenerate",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    assert_eq!(again["generated"], 0);
    assert_eq!(again["skipped"], 9);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.artifacts.list",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    assert_eq!(listed["artifacts"].as_array().map(|a| a.len()), Some(9));

    let out = workspace.join("exports").join("p6b.zip");
    let bundle = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.exportBundle",
        with_scope(&scope, json!({ "actor": staff(), "outPath": out.to_string_lossy() })),
    );
    assert_eq!(bundle["entryCount"], 10);
    let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).expect("open bundle")).expect("zip");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains("st10"));
}

#[test]
fn download_counts_every_call_and_regenerate_keeps_identity() {
    let workspace = temp_dir("resultsd-download");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "1a",
        "setup.update",
        json!({ "actor": staff(), "section": "school", "patch": { "name": "Greenfield Academy" } }),
    );
    let scope = scope();
    seed_scope(&mut stdin, &mut reader, &scope, &["math"], 1, &[(1, "math", 32.0, 55.0)]);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.compute",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.term.list",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    let tr_id = rows["results"][0]["id"].as_str().unwrap_or("").to_string();

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "reports.generate",
        json!({ "actor": staff(), "termResultId": "never-computed" }),
    );
    assert_eq!(code, "not_ready");

    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.generate",
        json!({ "actor": staff(), "termResultId": tr_id }),
    );
    assert_eq!(generated["generated"], true);
    let artifact_id = generated["artifact"]["id"].as_str().unwrap_or("").to_string();

    let mut last_count = 0;
    let mut last_at = String::new();
    for i in 0..3 {
        let d = request_ok(
            &mut stdin,
            &mut reader,
            &format!("dl-{}", i),
            "reports.download",
            json!({ "actor": staff(), "artifactId": artifact_id }),
        );
        let count = d["artifact"]["downloadCount"].as_i64().unwrap_or(0);
        let at = d["artifact"]["lastDownloadedAt"].as_str().unwrap_or("").to_string();
        assert!(count > last_count);
        assert!(at >= last_at && !at.is_empty());
        last_count = count;
        last_at = at;

        assert!(d["contentType"].as_str().unwrap_or("").starts_with("text/html"));
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(d["dataBase64"].as_str().unwrap_or(""))
            .expect("base64");
        let html = String::from_utf8(bytes).expect("utf8");
        assert!(html.contains("Greenfield Academy"));
        assert!(html.contains("87.00"));
    }
    assert_eq!(last_count, 3);

    // Unpublished results hide their documents from non-privileged callers.
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "reports.download",
        json!({ "artifactId": artifact_id }),
    );
    assert_eq!(code, "not_found");

    // Recompute keeps the result id, marking the document stale.
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.compute",
        with_scope(&scope, json!({ "actor": staff(), "recompute": true })),
    );
    let stale = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reports.generate",
        json!({ "actor": staff(), "termResultId": tr_id }),
    );
    assert_eq!(stale["generated"], false);
    assert_eq!(stale["artifact"]["stale"], true);

    let regenerated = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.generate",
        json!({ "actor": staff(), "termResultId": tr_id, "regenerate": true }),
    );
    assert_eq!(regenerated["generated"], true);
    assert_eq!(regenerated["artifact"]["id"], artifact_id.as_str());
    assert_eq!(regenerated["artifact"]["downloadCount"], 3);
    assert_eq!(regenerated["artifact"]["stale"], false);
}

#[test]
fn render_timeout_setting_is_validated() {
    let workspace = temp_dir("resultsd-render-setup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "actor": staff(), "section": "reports", "patch": { "renderTimeoutMs": 10 } }),
    );
    assert_eq!(code, "bad_params");
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "actor": staff(), "section": "reports", "patch": { "renderTimeoutMs": 250, "showPositions": false } }),
    );
    assert_eq!(updated["renderTimeoutMs"], 250);
    let setup = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(setup["reports"]["showPositions"], false);
    assert_eq!(setup["computation"]["componentWeighting"], "raw");
}
