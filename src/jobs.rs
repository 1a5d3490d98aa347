use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use uuid::Uuid;

use crate::artifacts::{self, ArtifactContext};
use crate::db::{self, now_ts};
use crate::error::{Result, ResultsError};
use crate::locks::{CancelFlag, ScopeLocks};
use crate::results::{self, ComputeRequest, ResultsContext};
use crate::scope::{Actor, Scope};

/// Finished jobs kept for `jobs.status`/`jobs.list`; older ones are dropped.
const MAX_FINISHED_JOBS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    Compute {
        scope: Scope,
        scale_id: Option<String>,
        recompute: bool,
    },
    BulkGenerate {
        scope: Scope,
        regenerate: bool,
    },
}

impl JobKind {
    fn name(&self) -> &'static str {
        match self {
            JobKind::Compute { .. } => "compute",
            JobKind::BulkGenerate { .. } => "bulkGenerate",
        }
    }

    fn scope(&self) -> &Scope {
        match self {
            JobKind::Compute { scope, .. } | JobKind::BulkGenerate { scope, .. } => scope,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub kind: &'static str,
    pub scope: Scope,
    pub state: JobState,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub cancel_requested: bool,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

struct JobEntry {
    info: JobInfo,
    cancel: CancelFlag,
}

/// Background units of work. Each job runs on its own thread with its own
/// database connection and shares only the scope locks with the caller.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
}

impl JobRegistry {
    pub fn start(
        &self,
        workspace: PathBuf,
        locks: ScopeLocks,
        kind: JobKind,
        actor: Actor,
    ) -> Result<JobInfo> {
        let id = Uuid::new_v4().to_string();
        let cancel = CancelFlag::default();
        let info = JobInfo {
            id: id.clone(),
            kind: kind.name(),
            scope: kind.scope().clone(),
            state: JobState::Running,
            started_at: now_ts(),
            finished_at: None,
            cancel_requested: false,
            result: None,
            error: None,
        };
        self.lock().insert(
            id.clone(),
            JobEntry {
                info: info.clone(),
                cancel: cancel.clone(),
            },
        );

        let registry = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", kind.name()))
            .spawn(move || {
                tracing::info!(job_id = %id, kind = kind.name(), scope = %kind.scope(), "job started");
                let outcome = run_job(workspace, &locks, &kind, &actor, &cancel);
                registry.finish(&id, outcome);
            });
        if let Err(e) = spawned {
            self.lock().remove(&info.id);
            return Err(e.into());
        }
        Ok(info)
    }

    pub fn status(&self, job_id: &str) -> Result<JobInfo> {
        self.lock()
            .get(job_id)
            .map(|e| e.info.clone())
            .ok_or_else(|| ResultsError::NotFound(format!("job {}", job_id)))
    }

    /// Requests cooperative cancellation; the job stops before its next
    /// student and rolls back anything uncommitted.
    pub fn cancel(&self, job_id: &str) -> Result<JobInfo> {
        let mut jobs = self.lock();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| ResultsError::NotFound(format!("job {}", job_id)))?;
        if entry.info.state == JobState::Running {
            entry.cancel.cancel();
            entry.info.cancel_requested = true;
            tracing::info!(job_id, "job cancellation requested");
        }
        Ok(entry.info.clone())
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let mut out: Vec<JobInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    fn finish(&self, job_id: &str, outcome: Result<Value>) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        entry.info.finished_at = Some(now_ts());
        match outcome {
            Ok(v) => {
                entry.info.state = JobState::Completed;
                entry.info.result = Some(v);
            }
            Err(ResultsError::Cancelled) => {
                entry.info.state = JobState::Cancelled;
            }
            Err(e) => {
                entry.info.state = JobState::Failed;
                entry.info.error = Some(json!({
                    "code": e.code(),
                    "message": e.to_string(),
                    "details": e.details(),
                }));
            }
        }
        tracing::info!(job_id, state = ?entry.info.state, "job finished");
        prune_finished(&mut jobs, MAX_FINISHED_JOBS);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Drops the oldest finished jobs beyond `keep`. Running jobs are never touched.
fn prune_finished(jobs: &mut HashMap<String, JobEntry>, keep: usize) {
    let mut finished: Vec<(String, String)> = jobs
        .values()
        .filter_map(|e| {
            e.info
                .finished_at
                .clone()
                .map(|at| (at, e.info.id.clone()))
        })
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

fn run_job(
    workspace: PathBuf,
    locks: &ScopeLocks,
    kind: &JobKind,
    actor: &Actor,
    cancel: &CancelFlag,
) -> Result<Value> {
    let conn = db::open_db(&workspace)
        .map_err(|e| ResultsError::Configuration(format!("failed to open workspace: {e:#}")))?;
    match kind {
        JobKind::Compute {
            scope,
            scale_id,
            recompute,
        } => {
            let summary = results::compute(
                &ResultsContext { conn: &conn, locks },
                &ComputeRequest {
                    scope,
                    scale_id: scale_id.as_deref(),
                    recompute: *recompute,
                    actor,
                },
                cancel,
            )?;
            Ok(serde_json::to_value(summary)?)
        }
        JobKind::BulkGenerate { scope, regenerate } => {
            let summary = artifacts::bulk_generate(
                &ArtifactContext {
                    conn: &conn,
                    workspace: &workspace,
                },
                scope,
                *regenerate,
                actor,
                cancel,
            )?;
            Ok(serde_json::to_value(summary)?)
        }
    }
}
