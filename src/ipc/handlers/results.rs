use crate::calc::{self, CalcContext};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn required_semester(req: &Request) -> Result<i64, serde_json::Value> {
    let semester = req
        .params
        .get("semester")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", "missing semester", None))?;
    if semester != 1 && semester != 2 {
        return Err(err(&req.id, "bad_params", "semester must be 1 or 2", None));
    }
    Ok(semester)
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_semester(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let semester = match required_semester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row: Result<Option<serde_json::Value>, rusqlite::Error> = conn
        .query_row(
            "SELECT section_id, average, rank FROM semester_results
             WHERE student_id = ? AND academic_year_id = ? AND semester = ?",
            (&student_id, &year_id, semester),
            |r| {
                Ok(json!({
                    "studentId": student_id,
                    "academicYearId": year_id,
                    "semester": semester,
                    "sectionId": r.get::<_, String>(0)?,
                    "average": r.get::<_, f64>(1)?,
                    "rank": r.get::<_, i64>(2)?,
                }))
            },
        )
        .optional();

    match row {
        Ok(v) => ok(&req.id, json!({ "semesterResult": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_final(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row: Result<Option<serde_json::Value>, rusqlite::Error> = conn
        .query_row(
            "SELECT section_id, combined_average, promotion_status, final_rank
             FROM final_results
             WHERE student_id = ? AND academic_year_id = ?",
            (&student_id, &year_id),
            |r| {
                Ok(json!({
                    "studentId": student_id,
                    "academicYearId": year_id,
                    "sectionId": r.get::<_, String>(0)?,
                    "combinedAverage": r.get::<_, f64>(1)?,
                    "promotionStatus": r.get::<_, String>(2)?,
                    "finalRank": r.get::<_, i64>(3)?,
                }))
            },
        )
        .optional();

    match row {
        Ok(v) => ok(&req.id, json!({ "finalResult": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_section(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let semester = match required_semester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT r.student_id, s.last_name, s.first_name, r.average, r.rank
             FROM semester_results r
             JOIN students s ON s.id = r.student_id
             WHERE r.section_id = ? AND r.academic_year_id = ? AND r.semester = ?
             ORDER BY r.rank",
        )?;
        let out = stmt.query_map((&section_id, &year_id, semester), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "lastName": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "average": r.get::<_, f64>(3)?,
                "rank": r.get::<_, i64>(4)?,
            }))
        })?
        .collect();
        out
    })();

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Section+subject ranking computed on the fly, with trend derived by
/// comparing against the adjacent term's ranking output for the same scope.
fn handle_subject_ranking(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let semester = match required_semester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ctx = CalcContext { conn };
    let entries = match calc::subject_ranking(&ctx, &section_id, &subject_id, &year_id, semester) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let previous: Option<HashMap<String, i64>> = if semester == 2 {
        match calc::subject_ranking(&ctx, &section_id, &subject_id, &year_id, 1) {
            Ok(prev) => Some(prev.into_iter().map(|e| (e.id, e.rank)).collect()),
            Err(e) => return err(&req.id, &e.code, e.message, e.details),
        }
    } else {
        None
    };

    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            let trend = match &previous {
                None => "new",
                Some(prev) => match prev.get(&e.id) {
                    None => "new",
                    Some(prev_rank) if *prev_rank > e.rank => "up",
                    Some(prev_rank) if *prev_rank < e.rank => "down",
                    Some(_) => "same",
                },
            };
            json!({
                "studentId": e.id,
                "percentage": e.score,
                "rank": e.rank,
                "trend": trend,
            })
        })
        .collect();

    ok(&req.id, json!({ "ranking": rows }))
}

/// Outbox for the post-finalization hook: hand over everything unconsumed
/// and mark it consumed, atomically.
fn handle_events_drain(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let events: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = tx.prepare(
            "SELECT id, kind, academic_year_id, grade_id, semester, created_at
             FROM result_events WHERE consumed = 0
             ORDER BY created_at, id",
        )?;
        let out = stmt.query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "yearId": r.get::<_, String>(2)?,
                "gradeId": r.get::<_, String>(3)?,
                "semester": r.get::<_, i64>(4)?,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })?
        .collect();
        out
    })();
    let events = match events {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("UPDATE result_events SET consumed = 1 WHERE consumed = 0", []) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "events": events }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.semester" => Some(handle_semester(state, req)),
        "results.final" => Some(handle_final(state, req)),
        "results.section" => Some(handle_section(state, req)),
        "results.subjectRanking" => Some(handle_subject_ranking(state, req)),
        "events.drain" => Some(handle_events_drain(state, req)),
        _ => None,
    }
}
