
use serde_json::json;
use std::time::{Duration, Instant};
use test_support::{request_err, request_ok, seed_scope, spawn_sidecar, staff, temp_dir, with_scope};

fn wait_for_job(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    job_id: &str,
) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut n = 0;
    loop {
        n += 1;
        let status = request_ok(
            stdin,
            reader,
            &format!("poll-{}", n),
            "jobs.status",
            json!({ "jobId": job_id }),
        );
        if status["state"] != "running" || Instant::now() > deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn compute_and_bulk_generate_run_as_background_jobs() {
    let workspace = temp_dir("resultsd-jobs");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let scope = json!({ "classroomId": "JSS1", "term": "First Term", "academicYear": "2025/2026" });
    seed_scope(
        &mut stdin,
        &mut reader,
        &scope,
        &["math", "eng"],
        3,
        &[
            (1, "math", 30.0, 40.0),
            (1, "eng", 30.0, 40.0),
            (2, "math", 20.0, 40.0),
            (2, "eng", 20.0, 30.0),
            (3, "math", 10.0, 20.0),
            (3, "eng", 10.0, 20.0),
        ],
    );

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "jobs.start",
        with_scope(&scope, json!({ "actor": staff(), "kind": "compute" })),
    );
    assert_eq!(started["kind"], "compute");
    let job_id = started["id"].as_str().unwrap_or("").to_string();
    let done = wait_for_job(&mut stdin, &mut reader, &job_id);
    assert_eq!(done["state"], "completed", "job: {}", done);
    assert_eq!(done["result"]["computed"], 3);

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "jobs.start",
        with_scope(&scope, json!({ "actor": staff(), "kind": "bulkGenerate" })),
    );
    let job_id = started["id"].as_str().unwrap_or("").to_string();
    let done = wait_for_job(&mut stdin, &mut reader, &job_id);
    assert_eq!(done["state"], "completed", "job: {}", done);
    assert_eq!(done["result"]["generated"], 3);

    // A compute job on an already computed scope fails with the collision code.
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "jobs.start",
        with_scope(&scope, json!({ "actor": staff(), "kind": "compute" })),
    );
    let job_id = started["id"].as_str().unwrap_or("").to_string();
    let done = wait_for_job(&mut stdin, &mut reader, &job_id);
    assert_eq!(done["state"], "failed");
    assert_eq!(done["error"]["code"], "already_computed");

    let list = request_ok(&mut stdin, &mut reader, "5", "jobs.list", json!({}));
    assert_eq!(list["jobs"].as_array().map(|a| a.len()), Some(3));

    // Finished jobs ignore cancellation.
    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "jobs.cancel",
        json!({ "actor": staff(), "jobId": job_id }),
    );
    assert_eq!(cancelled["state"], "failed");
    assert_eq!(cancelled["cancelRequested"], false);

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "jobs.start",
        with_scope(&scope, json!({ "actor": staff(), "kind": "reindex" })),
    );
    assert_eq!(code, "bad_params");
}
