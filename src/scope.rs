use serde::{Deserialize, Serialize};
use std::fmt;

/// The (classroom, term, academic year) triple bounding one computation and
/// ranking pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub classroom_id: String,
    pub term: String,
    pub academic_year: String,
}

impl Scope {
    pub fn new(classroom_id: &str, term: &str, academic_year: &str) -> Self {
        Self {
            classroom_id: classroom_id.to_string(),
            term: term.to_string(),
            academic_year: academic_year.to_string(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.classroom_id, self.term, self.academic_year)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} {}", self.classroom_id, self.term, self.academic_year)
    }
}

/// Caller identity used for attribution and for the publish gate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub privileged: bool,
}

impl Actor {
    #[cfg(test)]
    pub fn staff(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            privileged: true,
        }
    }

    /// Internal reads that must see unpublished rows.
    pub fn system() -> Self {
        Self {
            id: None,
            privileged: true,
        }
    }

    pub fn attribution(&self) -> &str {
        self.id.as_deref().unwrap_or("system")
    }
}
