use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::term;
use rusqlite::Connection;
use serde_json::json;

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
        return Err(err(
            &req.id,
            "bad_params",
            "semester must be 1 or 2",
            Some(json!({ "semester": semester })),
        ));
    }
    Ok(semester)
}

fn actor(req: &Request) -> Option<String> {
    req.params
        .get("actor")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

struct TermKey {
    grade_id: String,
    semester: i64,
    year_id: String,
}

fn term_key(req: &Request) -> Result<TermKey, serde_json::Value> {
    Ok(TermKey {
        grade_id: required_str(req, "gradeId")?,
        semester: required_semester(req)?,
        year_id: required_str(req, "yearId")?,
    })
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let key = match term_key(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match term::open_semester(conn, &key.grade_id, key.semester, &key.year_id, actor(req).as_deref())
    {
        Ok(()) => ok(&req.id, json!({ "status": "open" })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let key = match term_key(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match term::close_semester(conn, &key.grade_id, key.semester, &key.year_id, actor(req).as_deref())
    {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "status": "closed",
                "aggregatedStudents": outcome.aggregated_students,
                "finalized": outcome.finalized,
                "rolloverYearId": outcome.rollover.as_ref().map(|r| r.year_id.clone()),
                "rolloverYearName": outcome.rollover.as_ref().map(|r| r.name.clone()),
            }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_reopen(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let key = match term_key(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match term::reopen_semester(
        conn,
        &key.grade_id,
        key.semester,
        &key.year_id,
        actor(req).as_deref(),
    ) {
        Ok(()) => ok(&req.id, json!({ "status": "open" })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let key = match term_key(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match term::term_status_get(conn, &key.grade_id, key.semester, &key.year_id) {
        Ok(Some(row)) => match serde_json::to_value(&row) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Ok(None) => err(
            &req.id,
            "not_found",
            "no term status for that grade, semester and year",
            None,
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn grade_ids(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT id FROM grades ORDER BY sort_order")?;
    let out = stmt.query_map([], |r| r.get::<_, String>(0))?.collect();
    out
}

/// Toggle-all is a loop over the per-grade transition, never a parallel
/// code path. Per-grade outcomes are reported individually.
fn handle_all(state: &mut AppState, req: &Request, close: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let semester = match required_semester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let actor = actor(req);

    let grades = match grade_ids(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut results = Vec::with_capacity(grades.len());
    for grade_id in grades {
        let outcome = if close {
            term::close_semester(conn, &grade_id, semester, &year_id, actor.as_deref()).map(|_| ())
        } else {
            term::open_semester(conn, &grade_id, semester, &year_id, actor.as_deref())
        };
        match outcome {
            Ok(()) => results.push(json!({ "gradeId": grade_id, "ok": true })),
            Err(e) => results.push(json!({
                "gradeId": grade_id,
                "ok": false,
                "error": { "code": e.code, "message": e.message },
            })),
        }
    }

    ok(&req.id, json!({ "results": results }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "terms.open" => Some(handle_open(state, req)),
        "terms.close" => Some(handle_close(state, req)),
        "terms.reopen" => Some(handle_reopen(state, req)),
        "terms.status" => Some(handle_status(state, req)),
        "terms.openAll" => Some(handle_all(state, req, false)),
        "terms.closeAll" => Some(handle_all(state, req, true)),
        _ => None,
    }
}
