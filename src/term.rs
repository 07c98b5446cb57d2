use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::calc::{self, CalcContext};
use crate::db;

const DEFAULT_PROMOTION_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, Serialize)]
pub struct TermError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TermError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

fn db_err(e: impl std::fmt::Display) -> TermError {
    TermError::new("db_query_failed", e.to_string())
}

fn aggregation_err(e: calc::CalcError) -> TermError {
    TermError::with_details(
        "aggregation_failed",
        format!("batch pass failed: {}", e.message),
        serde_json::json!({ "innerCode": e.code }),
    )
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone)]
pub struct YearRow {
    pub id: String,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermStatusRow {
    pub status: String,
    pub is_declared: bool,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
    pub opened_by: Option<String>,
    pub closed_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RolloverInfo {
    pub year_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub aggregated_students: usize,
    pub finalized: bool,
    pub rollover: Option<RolloverInfo>,
}

pub fn year_get(conn: &Connection, year_id: &str) -> Result<Option<YearRow>, TermError> {
    conn.query_row(
        "SELECT id, name, start_date, end_date, is_current
         FROM academic_years WHERE id = ?",
        [year_id],
        year_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn year_by_name(conn: &Connection, name: &str) -> Result<Option<YearRow>, TermError> {
    conn.query_row(
        "SELECT id, name, start_date, end_date, is_current
         FROM academic_years WHERE name = ?",
        [name],
        year_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn year_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<YearRow> {
    Ok(YearRow {
        id: r.get(0)?,
        name: r.get(1)?,
        start_date: r.get(2)?,
        end_date: r.get(3)?,
        is_current: r.get::<_, i64>(4)? != 0,
    })
}

/// Derived year status; never stored.
pub fn derive_year_status(is_current: bool, end_date: &str, today: NaiveDate) -> &'static str {
    if is_current {
        return "active";
    }
    match NaiveDate::parse_from_str(end_date, "%Y-%m-%d") {
        Ok(end) if end < today => "completed",
        _ => "upcoming",
    }
}

fn parse_year_name(name: &str) -> Option<(i32, i32)> {
    let (a, b) = name.split_once('-')?;
    if a.len() != 4 || b.len() != 4 {
        return None;
    }
    let a: i32 = a.parse().ok()?;
    let b: i32 = b.parse().ok()?;
    Some((a, b))
}

fn shift_one_year(d: NaiveDate) -> NaiveDate {
    // Feb 29 collapses to Feb 28 in the target year.
    d.with_year(d.year() + 1)
        .or_else(|| NaiveDate::from_ymd_opt(d.year() + 1, 2, 28))
        .unwrap_or(d)
}

/// Create an academic year plus its full set of closed TermStatus rows.
/// A name collision is a validation error, never a second row.
pub fn year_create(
    conn: &Connection,
    name: &str,
    start_date: &str,
    end_date: &str,
) -> Result<String, TermError> {
    let Some((first, second)) = parse_year_name(name) else {
        return Err(TermError::new(
            "bad_params",
            "year name must have the form YYYY-YYYY",
        ));
    };
    if second != first + 1 {
        return Err(TermError::new(
            "bad_params",
            "year name halves must be consecutive years",
        ));
    }
    let start = NaiveDate::parse_from_str(start_date, "%Y-%m-%d")
        .map_err(|_| TermError::new("bad_params", "startDate must be YYYY-MM-DD"))?;
    let end = NaiveDate::parse_from_str(end_date, "%Y-%m-%d")
        .map_err(|_| TermError::new("bad_params", "endDate must be YYYY-MM-DD"))?;
    if end <= start {
        return Err(TermError::new("bad_params", "endDate must follow startDate"));
    }

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    if year_by_name(&tx, name)?.is_some() {
        return Err(TermError::with_details(
            "duplicate_resource",
            format!("academic year {} already exists", name),
            serde_json::json!({ "name": name }),
        ));
    }
    let year_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date, is_current)
         VALUES(?, ?, ?, ?, 0)",
        (&year_id, name, start_date, end_date),
    )
    .map_err(|e| TermError::new("db_insert_failed", e.to_string()))?;
    create_default_statuses(&tx, &year_id)?;
    tx.commit().map_err(db_err)?;

    info!(year = name, "academic year created");
    Ok(year_id)
}

/// One closed TermStatus row per (grade, semester) of the year. Idempotent,
/// so rollover and grade backfill can share it.
fn create_default_statuses(conn: &Connection, year_id: &str) -> Result<usize, TermError> {
    conn.execute(
        "INSERT OR IGNORE INTO term_statuses(academic_year_id, grade_id, semester, status)
         SELECT ?, g.id, s.semester, 'closed'
         FROM grades g
         CROSS JOIN (SELECT 1 AS semester UNION ALL SELECT 2) s",
        [year_id],
    )
    .map_err(|e| TermError::new("db_insert_failed", e.to_string()))
}

/// Backfill closed TermStatus rows for a grade created after its years.
pub fn create_statuses_for_grade(conn: &Connection, grade_id: &str) -> Result<usize, TermError> {
    conn.execute(
        "INSERT OR IGNORE INTO term_statuses(academic_year_id, grade_id, semester, status)
         SELECT y.id, ?, s.semester, 'closed'
         FROM academic_years y
         CROSS JOIN (SELECT 1 AS semester UNION ALL SELECT 2) s",
        [grade_id],
    )
    .map_err(|e| TermError::new("db_insert_failed", e.to_string()))
}

/// Make `year_id` the single current year: clear-then-set in one
/// transaction so there is no window with zero or two current years.
pub fn year_activate(conn: &Connection, year_id: &str) -> Result<(), TermError> {
    let tx = conn.unchecked_transaction().map_err(db_err)?;
    let Some(year) = year_get(&tx, year_id)? else {
        return Err(TermError::new("not_found", "academic year not found"));
    };
    tx.execute("UPDATE academic_years SET is_current = 0 WHERE is_current = 1", [])
        .map_err(db_err)?;
    tx.execute(
        "UPDATE academic_years SET is_current = 1 WHERE id = ?",
        [year_id],
    )
    .map_err(db_err)?;
    tx.commit().map_err(db_err)?;

    info!(year = %year.name, "academic year activated");
    Ok(())
}

pub fn term_status_get(
    conn: &Connection,
    grade_id: &str,
    semester: i64,
    year_id: &str,
) -> Result<Option<TermStatusRow>, TermError> {
    conn.query_row(
        "SELECT status, is_declared, opened_at, closed_at, opened_by, closed_by
         FROM term_statuses
         WHERE academic_year_id = ? AND grade_id = ? AND semester = ?",
        (year_id, grade_id, semester),
        |r| {
            Ok(TermStatusRow {
                status: r.get(0)?,
                is_declared: r.get::<_, i64>(1)? != 0,
                opened_at: r.get(2)?,
                closed_at: r.get(3)?,
                opened_by: r.get(4)?,
                closed_by: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn status_field(conn: &Connection, grade_id: &str, semester: i64, year_id: &str) -> Result<Option<String>, TermError> {
    conn.query_row(
        "SELECT status FROM term_statuses
         WHERE academic_year_id = ? AND grade_id = ? AND semester = ?",
        (year_id, grade_id, semester),
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err)
}

/// Flip every assessment/mark flag in the (grade, semester, year) scope.
/// The single writer of is_editable/is_locked after creation.
fn apply_lock(
    conn: &Connection,
    grade_id: &str,
    semester: i64,
    year_id: &str,
    locked: bool,
) -> Result<(usize, usize), TermError> {
    let stamp: Option<String> = if locked { Some(now_rfc3339()) } else { None };
    let assessments = conn
        .execute(
            "UPDATE assessments SET is_editable = ?, locked_at = ?
             WHERE academic_year_id = ? AND grade_id = ? AND semester = ?",
            ((!locked) as i64, &stamp, year_id, grade_id, semester),
        )
        .map_err(db_err)?;
    let marks = conn
        .execute(
            "UPDATE marks SET is_locked = ?, locked_at = ?
             WHERE academic_year_id = ? AND grade_id = ? AND semester = ?",
            (locked as i64, &stamp, year_id, grade_id, semester),
        )
        .map_err(db_err)?;
    Ok((assessments, marks))
}

fn require_status_row(
    conn: &Connection,
    grade_id: &str,
    semester: i64,
    year_id: &str,
) -> Result<String, TermError> {
    status_field(conn, grade_id, semester, year_id)?.ok_or_else(|| {
        TermError::new(
            "not_found",
            "no term status for that grade, semester and year",
        )
    })
}

/// Open a semester for mark entry. Semester 2 cannot open until semester 1
/// has closed for the same year. The closed->open check-and-set is the
/// mutual exclusion point: a term that is already open rejects the call.
pub fn open_semester(
    conn: &Connection,
    grade_id: &str,
    semester: i64,
    year_id: &str,
    actor: Option<&str>,
) -> Result<(), TermError> {
    require_status_row(conn, grade_id, semester, year_id)?;

    if semester == 2 {
        let sem1 = require_status_row(conn, grade_id, 1, year_id)?;
        if sem1 != "closed" {
            warn!(grade = grade_id, "semester 2 open blocked by semester 1");
            return Err(TermError::with_details(
                "precondition_failed",
                "semester 2 cannot open until semester 1 is closed",
                serde_json::json!({ "blockingSemester": 1, "status": sem1 }),
            ));
        }
    }

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    let changed = tx
        .execute(
            "UPDATE term_statuses
             SET status = 'open', is_declared = 0, opened_at = ?, opened_by = ?,
                 closed_at = NULL, closed_by = NULL
             WHERE academic_year_id = ? AND grade_id = ? AND semester = ?
               AND status = 'closed'",
            (now_rfc3339(), actor, year_id, grade_id, semester),
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(TermError::with_details(
            "precondition_failed",
            format!("semester {} is already open", semester),
            serde_json::json!({ "semester": semester, "status": "open" }),
        ));
    }
    apply_lock(&tx, grade_id, semester, year_id, false)?;
    tx.commit().map_err(db_err)?;

    info!(grade = grade_id, semester, year = year_id, "semester opened");
    Ok(())
}

/// Undo a close without recomputing anything: unlock the scope and clear
/// the declared flag. Previously computed results stay put, stale until the
/// next close.
pub fn reopen_semester(
    conn: &Connection,
    grade_id: &str,
    semester: i64,
    year_id: &str,
    actor: Option<&str>,
) -> Result<(), TermError> {
    require_status_row(conn, grade_id, semester, year_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    let changed = tx
        .execute(
            "UPDATE term_statuses
             SET status = 'open', is_declared = 0, opened_at = ?, opened_by = ?,
                 closed_at = NULL, closed_by = NULL
             WHERE academic_year_id = ? AND grade_id = ? AND semester = ?
               AND status = 'closed'",
            (now_rfc3339(), actor, year_id, grade_id, semester),
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(TermError::with_details(
            "precondition_failed",
            format!("semester {} is not closed", semester),
            serde_json::json!({ "semester": semester, "status": "open" }),
        ));
    }
    apply_lock(&tx, grade_id, semester, year_id, false)?;
    tx.commit().map_err(db_err)?;

    info!(grade = grade_id, semester, year = year_id, "semester reopened");
    Ok(())
}

/// Close a semester: lock the scope, recompute and rank its results, and on
/// semester 2 finalize the year and (for the current year) roll the
/// calendar over. One transaction end to end; any failure leaves the status
/// open and the marks unlocked.
pub fn close_semester(
    conn: &Connection,
    grade_id: &str,
    semester: i64,
    year_id: &str,
    actor: Option<&str>,
) -> Result<CloseOutcome, TermError> {
    let Some(year) = year_get(conn, year_id)? else {
        return Err(TermError::new("not_found", "academic year not found"));
    };
    require_status_row(conn, grade_id, semester, year_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err)?;

    let current_count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM academic_years WHERE is_current = 1",
            [],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    if current_count > 1 {
        return Err(TermError::new(
            "invariant_violation",
            "more than one academic year is marked current",
        ));
    }

    let changed = tx
        .execute(
            "UPDATE term_statuses
             SET status = 'closed', is_declared = 1, closed_at = ?, closed_by = ?
             WHERE academic_year_id = ? AND grade_id = ? AND semester = ?
               AND status = 'open'",
            (now_rfc3339(), actor, year_id, grade_id, semester),
        )
        .map_err(db_err)?;
    if changed == 0 {
        warn!(grade = grade_id, semester, "close rejected: semester not open");
        return Err(TermError::with_details(
            "precondition_failed",
            format!("semester {} is not open", semester),
            serde_json::json!({ "semester": semester, "status": "closed" }),
        ));
    }

    apply_lock(&tx, grade_id, semester, year_id, true)?;

    let ctx = CalcContext { conn: &tx };
    let aggregated = calc::aggregate_semester(&ctx, year_id, semester, Some(grade_id))
        .map_err(aggregation_err)?;

    let mut finalized = false;
    let mut rollover = None;
    if semester == 2 {
        let threshold = promotion_threshold(&tx)?;
        calc::finalize_year(&ctx, year_id, grade_id, threshold).map_err(aggregation_err)?;
        tx.execute(
            "INSERT INTO result_events(id, kind, academic_year_id, grade_id, semester, created_at, consumed)
             VALUES(?, 'year_finalized', ?, ?, 2, ?, 0)",
            (Uuid::new_v4().to_string(), year_id, grade_id, now_rfc3339()),
        )
        .map_err(|e| TermError::new("db_insert_failed", e.to_string()))?;
        finalized = true;

        if year.is_current {
            rollover = rollover_year(&tx, &year)?;
        }
    }

    tx.commit().map_err(db_err)?;

    info!(
        grade = grade_id,
        semester,
        year = %year.name,
        aggregated,
        finalized,
        "semester closed"
    );
    Ok(CloseOutcome {
        aggregated_students: aggregated,
        finalized,
        rollover,
    })
}

/// Create the next academic year: both name halves incremented, dates
/// shifted one year, not current, all statuses closed. A no-op when an
/// earlier close already created it.
fn rollover_year(conn: &Connection, year: &YearRow) -> Result<Option<RolloverInfo>, TermError> {
    let Some((first, second)) = parse_year_name(&year.name) else {
        return Err(TermError::new(
            "invariant_violation",
            format!("stored year name {} is not YYYY-YYYY", year.name),
        ));
    };
    let next_name = format!("{}-{}", first + 1, second + 1);
    if year_by_name(conn, &next_name)?.is_some() {
        return Ok(None);
    }

    let start = NaiveDate::parse_from_str(&year.start_date, "%Y-%m-%d")
        .map_err(|_| TermError::new("invariant_violation", "stored start date is unparseable"))?;
    let end = NaiveDate::parse_from_str(&year.end_date, "%Y-%m-%d")
        .map_err(|_| TermError::new("invariant_violation", "stored end date is unparseable"))?;

    let next_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date, is_current)
         VALUES(?, ?, ?, ?, 0)",
        (
            &next_id,
            &next_name,
            shift_one_year(start).format("%Y-%m-%d").to_string(),
            shift_one_year(end).format("%Y-%m-%d").to_string(),
        ),
    )
    .map_err(|e| TermError::new("db_insert_failed", e.to_string()))?;
    create_default_statuses(conn, &next_id)?;

    info!(year = %next_name, "rolled over to next academic year");
    Ok(Some(RolloverInfo {
        year_id: next_id,
        name: next_name,
    }))
}

fn promotion_threshold(conn: &Connection) -> Result<f64, TermError> {
    let value = db::settings_get_json(conn, "promotion.threshold")
        .map_err(|e| TermError::new("db_query_failed", e.to_string()))?;
    Ok(value
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_PROMOTION_THRESHOLD))
}
