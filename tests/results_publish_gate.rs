
use serde_json::json;
use test_support::{request_err, request_ok, seed_scope, spawn_sidecar, staff, temp_dir, with_scope};

#[test]
fn publish_unpublish_publish_restores_visibility_without_touching_scores() {
    let workspace = temp_dir("resultsd-publish-gate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let scope = json!({ "classroomId": "JSS2", "term": "Second Term", "academicYear": "2024/2025" });
    seed_scope(
        &mut stdin,
        &mut reader,
        &scope,
        &["math"],
        3,
        &[(1, "math", 30.0, 50.0), (2, "math", 25.0, 40.0), (3, "math", 12.0, 20.0)],
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.compute",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    let staff_view = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.term.list",
        with_scope(&scope, json!({ "actor": staff() })),
    );

    // Anonymous callers see nothing before publishing.
    let public = request_ok(&mut stdin, &mut reader, "4", "results.term.list", scope.clone());
    assert_eq!(public["results"], json!([]));
    let tr_id = staff_view["results"][0]["id"].as_str().unwrap_or("").to_string();
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "results.subjects.list",
        json!({ "termResultId": tr_id }),
    );
    assert_eq!(code, "not_found");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "results.publish",
        with_scope(&scope, json!({ "action": "publish" })),
    );
    assert_eq!(code, "forbidden");

    let published = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.publish",
        with_scope(&scope, json!({ "actor": staff(), "action": "publish" })),
    );
    assert_eq!(published["updated"], 3);
    let visible = request_ok(&mut stdin, &mut reader, "8", "results.term.list", scope.clone());
    assert_eq!(visible["results"].as_array().map(|a| a.len()), Some(3));
    let published_at = visible["results"][0]["publishedAt"].clone();
    assert!(published_at.is_string());

    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.publish",
        with_scope(&scope, json!({ "actor": staff(), "action": "unpublish" })),
    );
    let hidden = request_ok(&mut stdin, &mut reader, "10", "results.term.list", scope.clone());
    assert_eq!(hidden["results"], json!([]));

    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "results.publish",
        with_scope(&scope, json!({ "actor": staff(), "action": "publish" })),
    );
    let restored = request_ok(&mut stdin, &mut reader, "12", "results.term.list", scope.clone());
    let ids = |v: &serde_json::Value| -> Vec<serde_json::Value> {
        v["results"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|r| json!([r["id"], r["averagePercentage"], r["overallGrade"], r["rankInClass"]]))
            .collect()
    };
    assert_eq!(ids(&visible), ids(&restored));
    assert_eq!(ids(&staff_view), ids(&restored));

    let by_student = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "results.term.forStudent",
        json!({ "studentId": "st01", "term": "Second Term" }),
    );
    assert_eq!(by_student["results"].as_array().map(|a| a.len()), Some(1));

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "14",
        "results.publish",
        with_scope(&scope, json!({ "actor": staff(), "action": "archive" })),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn remarks_survive_recompute_and_class_summary_counts_grades() {
    let workspace = temp_dir("resultsd-remarks");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let scope = json!({ "classroomId": "SS3", "term": "Third Term", "academicYear": "2023/2024" });
    seed_scope(
        &mut stdin,
        &mut reader,
        &scope,
        &["chem", "phy"],
        2,
        &[
            (1, "chem", 36.0, 50.0),
            (1, "phy", 34.0, 52.0),
            (2, "chem", 10.0, 20.0),
            (2, "phy", 12.0, 18.0),
        ],
    );
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
    let top = rows["results"][0]["id"].as_str().unwrap_or("").to_string();
    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.subjects.list",
        json!({ "actor": staff(), "termResultId": top }),
    );
    let chem = subjects["subjects"][0]["id"].as_str().unwrap_or("").to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.remarks.update",
        json!({ "actor": staff(), "termResultId": top, "remarks": "Outstanding term" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.remarks.update",
        json!({ "actor": staff(), "subjectResultId": chem, "remarks": "Strong practicals" }),
    );
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "results.remarks.update",
        json!({ "actor": staff(), "remarks": "no target" }),
    );
    assert_eq!(code, "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.compute",
        with_scope(&scope, json!({ "actor": staff(), "recompute": true })),
    );
    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.term.list",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    assert_eq!(rows["results"][0]["id"], top.as_str());
    assert_eq!(rows["results"][0]["remarks"], "Outstanding term");
    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "results.subjects.list",
        json!({ "actor": staff(), "termResultId": top }),
    );
    assert_eq!(subjects["subjects"][0]["subjectId"], "chem");
    assert_eq!(subjects["subjects"][0]["teacherRemarks"], "Strong practicals");

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "results.classSummary",
        with_scope(&scope, json!({ "actor": staff() })),
    );
    assert_eq!(summary["studentCount"], 2);
    assert_eq!(summary["gradeDistribution"]["A"], 1);
    assert_eq!(summary["gradeDistribution"]["F"], 1);
    assert_eq!(summary["subjects"].as_array().map(|a| a.len()), Some(2));
}
