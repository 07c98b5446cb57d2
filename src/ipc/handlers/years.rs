use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::term;
use chrono::Utc;
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

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let start_date = match required_str(req, "startDate") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let end_date = match required_str(req, "endDate") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match term::year_create(conn, &name, &start_date, &end_date) {
        Ok(year_id) => ok(&req.id, json!({ "yearId": year_id })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match term::year_activate(conn, &year_id) {
        Ok(()) => ok(&req.id, json!({})),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let today = Utc::now().date_naive();
    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, name, start_date, end_date, is_current
             FROM academic_years ORDER BY name",
        )?;
        let out = stmt.query_map([], |r| {
            let end_date: String = r.get(3)?;
            let is_current = r.get::<_, i64>(4)? != 0;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": end_date.clone(),
                "isCurrent": is_current,
                "status": term::derive_year_status(is_current, &end_date, today),
            }))
        })?
        .collect();
        out
    })();

    match rows {
        Ok(years) => ok(&req.id, json!({ "years": years })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_create(state, req)),
        "years.activate" => Some(handle_activate(state, req)),
        "years.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
