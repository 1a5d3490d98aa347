use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::{self, now_ts};
use crate::error::{Result, ResultsError};
use crate::grading::{default_scale_rules, validate_rules, GradeScale, GradeScaleRule};

pub const DEFAULT_SCALE_NAME: &str = "Standard";

/// Persists a new scale. Rules are validated for full [0, 100] coverage
/// before anything is written; scales are never edited afterwards.
pub fn create_scale(
    conn: &Connection,
    name: &str,
    rules: &[GradeScaleRule],
    make_default: bool,
) -> Result<GradeScale> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ResultsError::BadParams("scale name must not be empty".into()));
    }
    let rules = validate_rules(rules)?;

    let tx = db::begin_write(conn)?;
    let has_default: bool = tx
        .query_row("SELECT 1 FROM grade_scales WHERE is_default = 1 LIMIT 1", [], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    let is_default = make_default || !has_default;
    if is_default {
        tx.execute("UPDATE grade_scales SET is_default = 0", [])?;
    }
    let scale = insert_scale(&tx, name, rules, is_default)?;
    tx.commit()?;
    tracing::info!(scale_id = %scale.id, name = %scale.name, is_default, "grade scale created");
    Ok(scale)
}

fn insert_scale(
    conn: &Connection,
    name: &str,
    rules: Vec<GradeScaleRule>,
    is_default: bool,
) -> Result<GradeScale> {
    let id = Uuid::new_v4().to_string();
    let created_at = now_ts();
    conn.execute(
        "INSERT INTO grade_scales(id, name, is_default, created_at) VALUES(?, ?, ?, ?)",
        (&id, name, is_default as i64, &created_at),
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO grade_scale_rules(id, scale_id, sort_order, lower_bound, upper_bound, letter, point, remark)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for (i, r) in rules.iter().enumerate() {
        stmt.execute((
            Uuid::new_v4().to_string(),
            &id,
            i as i64,
            r.lower_bound,
            r.upper_bound,
            r.letter.trim(),
            r.point,
            &r.remark,
        ))?;
    }
    Ok(GradeScale {
        id,
        name: name.to_string(),
        is_default,
        created_at,
        rules,
    })
}

fn load_rules(conn: &Connection, scale_id: &str) -> Result<Vec<GradeScaleRule>> {
    let mut stmt = conn.prepare(
        "SELECT lower_bound, upper_bound, letter, point, remark
         FROM grade_scale_rules
         WHERE scale_id = ?
         ORDER BY sort_order",
    )?;
    let rules = stmt
        .query_map([scale_id], |r| {
            Ok(GradeScaleRule {
                lower_bound: r.get(0)?,
                upper_bound: r.get(1)?,
                letter: r.get(2)?,
                point: r.get(3)?,
                remark: r.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

pub fn get_scale(conn: &Connection, scale_id: &str) -> Result<GradeScale> {
    let head: Option<(String, String, i64, String)> = conn
        .query_row(
            "SELECT id, name, is_default, created_at FROM grade_scales WHERE id = ?",
            [scale_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((id, name, is_default, created_at)) = head else {
        return Err(ResultsError::NotFound(format!("grade scale {}", scale_id)));
    };
    let rules = load_rules(conn, &id)?;
    Ok(GradeScale {
        id,
        name,
        is_default: is_default != 0,
        created_at,
        rules,
    })
}

pub fn list_scales(conn: &Connection) -> Result<Vec<GradeScale>> {
    let mut stmt = conn.prepare("SELECT id FROM grade_scales ORDER BY created_at, rowid")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    ids.iter().map(|id| get_scale(conn, id)).collect()
}

pub fn set_default(conn: &Connection, scale_id: &str) -> Result<GradeScale> {
    let tx = db::begin_write(conn)?;
    tx.execute("UPDATE grade_scales SET is_default = 0", [])?;
    let changed = tx.execute("UPDATE grade_scales SET is_default = 1 WHERE id = ?", [scale_id])?;
    if changed == 0 {
        return Err(ResultsError::NotFound(format!("grade scale {}", scale_id)));
    }
    tx.commit()?;
    get_scale(conn, scale_id)
}

/// Provisions the standard scale when the workspace has none. Returns the
/// default scale and whether it was created by this call.
pub fn ensure_default_scale(conn: &Connection) -> Result<(GradeScale, bool)> {
    let tx = db::begin_write(conn)?;
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM grade_scales", [], |r| r.get(0))?;
    if count == 0 {
        let rules = validate_rules(&default_scale_rules())?;
        let scale = insert_scale(&tx, DEFAULT_SCALE_NAME, rules, true)?;
        tx.commit()?;
        tracing::info!(scale_id = %scale.id, "provisioned default grade scale");
        return Ok((scale, true));
    }
    tx.commit()?;
    Ok((default_scale(conn)?, false))
}

fn default_scale(conn: &Connection) -> Result<GradeScale> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM grade_scales ORDER BY is_default DESC, created_at, rowid LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;
    match id {
        Some(id) => get_scale(conn, &id),
        None => Err(ResultsError::Configuration("no grade scale configured".into())),
    }
}

/// Picks the scale for a computation: the requested one, or the workspace
/// default (provisioned on first use).
pub fn resolve_scale(conn: &Connection, scale_id: Option<&str>) -> Result<GradeScale> {
    let scale = match scale_id {
        Some(id) => get_scale(conn, id).map_err(|e| match e {
            ResultsError::NotFound(what) => ResultsError::Configuration(format!("{} does not exist", what)),
            other => other,
        })?,
        None => ensure_default_scale(conn)?.0,
    };
    // Stored rules were validated on write; re-check in case the table was edited by hand.
    validate_rules(&scale.rules)?;
    Ok(scale)
}
