use serde_json::json;

/// Errors raised by the grading, computation and report layers.
///
/// Every variant maps to exactly one IPC error code, see [`ResultsError::code`].
#[derive(thiserror::Error, Debug)]
pub enum ResultsError {
    /// Missing or invalid grade scale, or invalid setup values.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Results already exist for the scope and recompute was not requested.
    #[error("results already computed for {students} student(s) in scope; pass recompute=true to rebuild")]
    AlreadyComputed { students: usize },
    /// Enrolled students still hold results for the term under another
    /// classroom, which has to be recomputed before they can be ranked here.
    #[error("{} enrolled student(s) already have results for this term under classroom {classroom_id}; recompute that classroom first", students.len())]
    ClassroomConflict {
        classroom_id: String,
        students: Vec<String>,
    },
    /// Roster or marks missing for a student.
    #[error("source data missing: {0}")]
    SourceDataMissing(String),
    /// Generation requested before the term result was computed.
    #[error("not ready: {0}")]
    NotReady(String),
    /// Template or rendering failure, including render timeouts.
    #[error("render failed: {0}")]
    Render(String),
    /// Scope already locked by an in-flight compute or publish.
    #[error("scope {0} is locked by another operation")]
    Concurrency(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadParams(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, ResultsError>;

impl ResultsError {
    pub fn code(&self) -> &'static str {
        match self {
            ResultsError::Configuration(_) => "configuration_error",
            ResultsError::AlreadyComputed { .. } => "already_computed",
            ResultsError::ClassroomConflict { .. } => "classroom_conflict",
            ResultsError::SourceDataMissing(_) => "source_data_missing",
            ResultsError::NotReady(_) => "not_ready",
            ResultsError::Render(_) => "render_error",
            ResultsError::Concurrency(_) => "scope_locked",
            ResultsError::NotFound(_) => "not_found",
            ResultsError::Forbidden(_) => "forbidden",
            ResultsError::BadParams(_) => "bad_params",
            ResultsError::Cancelled => "cancelled",
            ResultsError::Db(_) | ResultsError::Json(_) => "db_query_failed",
            ResultsError::Io(_) | ResultsError::Zip(_) => "io_failed",
        }
    }

    /// Short reason used in per-student entries of batch summaries.
    pub fn reason(&self) -> &'static str {
        match self {
            ResultsError::Configuration(_) => "ConfigurationError",
            ResultsError::AlreadyComputed { .. } => "AlreadyComputed",
            ResultsError::ClassroomConflict { .. } => "ClassroomConflict",
            ResultsError::SourceDataMissing(_) => "SourceDataMissing",
            ResultsError::NotReady(_) => "NotReady",
            ResultsError::Render(_) => "RenderError",
            ResultsError::Concurrency(_) => "ConcurrencyError",
            ResultsError::NotFound(_) => "NotFound",
            ResultsError::Forbidden(_) => "Forbidden",
            ResultsError::BadParams(_) => "BadParams",
            ResultsError::Cancelled => "Cancelled",
            ResultsError::Db(_) | ResultsError::Json(_) => "StorageError",
            ResultsError::Io(_) | ResultsError::Zip(_) => "IoError",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ResultsError::AlreadyComputed { students } => {
                Some(json!({ "existingStudents": students }))
            }
            ResultsError::ClassroomConflict {
                classroom_id,
                students,
            } => Some(json!({ "classroomId": classroom_id, "students": students })),
            _ => None,
        }
    }
}
