use serde_json::json;

use crate::error::ResultsError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn err_from(id: &str, e: &ResultsError) -> serde_json::Value {
    match e {
        ResultsError::Db(_) | ResultsError::Io(_) | ResultsError::Zip(_) | ResultsError::Json(_) => {
            tracing::error!(code = e.code(), error = %e, "request failed");
        }
        _ => tracing::debug!(code = e.code(), error = %e, "request rejected"),
    }
    err(id, e.code(), e.to_string(), e.details())
}

/// Wraps a handler outcome in the response envelope.
pub fn respond<T: serde::Serialize>(id: &str, res: crate::error::Result<T>) -> serde_json::Value {
    match res.and_then(|v| serde_json::to_value(v).map_err(ResultsError::from)) {
        Ok(v) => ok(id, v),
        Err(e) => err_from(id, &e),
    }
}
