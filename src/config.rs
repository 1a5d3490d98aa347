use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::db;
use crate::error::{Result, ResultsError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Computation,
    Reports,
    School,
}

impl SetupSection {
    pub const ALL: [SetupSection; 3] = [
        SetupSection::Computation,
        SetupSection::Reports,
        SetupSection::School,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "computation" => Some(Self::Computation),
            "reports" => Some(Self::Reports),
            "school" => Some(Self::School),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Computation => "computation",
            Self::Reports => "reports",
            Self::School => "school",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Computation => "setup.computation",
            Self::Reports => "setup.reports",
            Self::School => "setup.school",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Computation => json!({
            "componentWeighting": "raw",
            "caWeight": 40,
            "examWeight": 60,
            "gpaMode": "simple",
            "defaultCaMax": 40,
            "defaultExamMax": 60,
            "decimalPlaces": 2
        }),
        SetupSection::Reports => json!({
            "renderTimeoutMs": 5000,
            "template": null,
            "showPositions": true,
            "showClassStatistics": true
        }),
        SetupSection::School => json!({
            "name": "",
            "logoUrl": null,
            "address": "",
            "motto": ""
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> std::result::Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> std::result::Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_positive_f64(v: &Value, key: &str) -> std::result::Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(n.is_finite() && n > 0.0) {
        return Err(format!("{} must be > 0", key));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> std::result::Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> std::result::Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    Ok(Value::String(parse_string_max(v, key, max_len)?))
}

fn parse_one_of(v: &Value, key: &str, allowed: &[&str]) -> std::result::Result<String, String> {
    let s = parse_string_max(v, key, 32)?;
    if !allowed.contains(&s.as_str()) {
        return Err(format!("{} must be one of: {}", key, allowed.join(", ")));
    }
    Ok(s)
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> std::result::Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Computation => match k.as_str() {
                "componentWeighting" => {
                    obj.insert(k.clone(), Value::String(parse_one_of(v, k, &["raw", "weighted"])?));
                }
                "gpaMode" => {
                    obj.insert(
                        k.clone(),
                        Value::String(parse_one_of(v, k, &["simple", "creditWeighted"])?),
                    );
                }
                "caWeight" | "examWeight" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                "defaultCaMax" | "defaultExamMax" => {
                    obj.insert(k.clone(), Value::from(parse_positive_f64(v, k)?));
                }
                "decimalPlaces" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 4)?));
                }
                _ => return Err(format!("unknown computation field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "renderTimeoutMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 50, 60_000)?));
                }
                "template" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 200_000)?);
                }
                "showPositions" | "showClassStatistics" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
            SetupSection::School => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "logoUrl" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 2_000)?);
                }
                "address" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 400)?));
                }
                "motto" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
        }
    }

    if section == SetupSection::Computation
        && obj.get("componentWeighting").and_then(|v| v.as_str()) == Some("weighted")
    {
        let ca = obj.get("caWeight").and_then(|v| v.as_i64()).unwrap_or(0);
        let exam = obj.get("examWeight").and_then(|v| v.as_i64()).unwrap_or(0);
        if ca + exam != 100 {
            return Err("caWeight + examWeight must equal 100 when weighted".into());
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> Result<Value> {
    let mut current = load_section(conn, section)
        .map_err(|e| ResultsError::Configuration(format!("{e:#}")))?;
    merge_section_patch(section, &mut current, patch).map_err(ResultsError::BadParams)?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| ResultsError::Configuration(format!("{e:#}")))?;
    Ok(current)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentWeighting {
    /// Sum of raw marks over sum of declared maxima.
    Raw,
    /// CA and exam percentages blended by weight, scored out of 100.
    Weighted { ca_weight: f64, exam_weight: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpaMode {
    Simple,
    CreditWeighted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputationConfig {
    pub weighting: ComponentWeighting,
    pub gpa_mode: GpaMode,
    pub default_ca_max: f64,
    pub default_exam_max: f64,
    pub decimal_places: u32,
}

impl Default for ComputationConfig {
    fn default() -> Self {
        Self::from_value(&default_section(SetupSection::Computation))
    }
}

impl ComputationConfig {
    fn from_value(v: &Value) -> Self {
        let num = |k: &str, d: f64| v.get(k).and_then(|x| x.as_f64()).unwrap_or(d);
        let weighting = match v.get("componentWeighting").and_then(|x| x.as_str()) {
            Some("weighted") => ComponentWeighting::Weighted {
                ca_weight: num("caWeight", 40.0),
                exam_weight: num("examWeight", 60.0),
            },
            _ => ComponentWeighting::Raw,
        };
        let gpa_mode = match v.get("gpaMode").and_then(|x| x.as_str()) {
            Some("creditWeighted") => GpaMode::CreditWeighted,
            _ => GpaMode::Simple,
        };
        Self {
            weighting,
            gpa_mode,
            default_ca_max: num("defaultCaMax", 40.0),
            default_exam_max: num("defaultExamMax", 60.0),
            decimal_places: v
                .get("decimalPlaces")
                .and_then(|x| x.as_u64())
                .unwrap_or(2) as u32,
        }
    }

    pub fn load(conn: &Connection) -> Result<Self> {
        let v = load_section(conn, SetupSection::Computation)
            .map_err(|e| ResultsError::Configuration(format!("{e:#}")))?;
        Ok(Self::from_value(&v))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportConfig {
    pub render_timeout: Duration,
    pub template: Option<String>,
    pub show_positions: bool,
    pub show_class_statistics: bool,
}

impl ReportConfig {
    pub fn load(conn: &Connection) -> Result<Self> {
        let v = load_section(conn, SetupSection::Reports)
            .map_err(|e| ResultsError::Configuration(format!("{e:#}")))?;
        Ok(Self {
            render_timeout: Duration::from_millis(
                v.get("renderTimeoutMs").and_then(|x| x.as_u64()).unwrap_or(5000),
            ),
            template: v
                .get("template")
                .and_then(|x| x.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.to_string()),
            show_positions: v.get("showPositions").and_then(|x| x.as_bool()).unwrap_or(true),
            show_class_statistics: v
                .get("showClassStatistics")
                .and_then(|x| x.as_bool())
                .unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolIdentity {
    pub name: String,
    pub logo_url: Option<String>,
    pub address: String,
    pub motto: String,
}

impl SchoolIdentity {
    pub fn load(conn: &Connection) -> Result<Self> {
        let v = load_section(conn, SetupSection::School)
            .map_err(|e| ResultsError::Configuration(format!("{e:#}")))?;
        let text = |k: &str| {
            v.get(k)
                .and_then(|x| x.as_str())
                .unwrap_or("")
                .to_string()
        };
        Ok(Self {
            name: text("name"),
            logo_url: v.get("logoUrl").and_then(|x| x.as_str()).map(|s| s.to_string()),
            address: text("address"),
            motto: text("motto"),
        })
    }
}
