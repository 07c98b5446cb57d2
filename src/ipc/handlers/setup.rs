use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::term;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

fn next_sort_order(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<i64, rusqlite::Error> {
    conn.query_row(sql, params, |r| r.get(0))
}

fn handle_grade_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let existing: Result<Option<String>, _> = conn
        .query_row("SELECT id FROM grades WHERE name = ?", [&name], |r| r.get(0))
        .optional();
    match existing {
        Ok(Some(_)) => {
            return err(
                &req.id,
                "duplicate_resource",
                format!("grade {} already exists", name),
                Some(json!({ "name": name })),
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let sort_order = match next_sort_order(&tx, "SELECT COUNT(*) FROM grades", &[]) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO grades(id, name, sort_order) VALUES(?, ?, ?)",
        (&grade_id, &name, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    // A grade added after its years still gets a full set of closed
    // term status rows.
    if let Err(e) = term::create_statuses_for_grade(&tx, &grade_id) {
        return err(&req.id, &e.code, e.message, e.details);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "gradeId": grade_id }))
}

fn handle_section_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let grade_exists: Result<Option<String>, _> = conn
        .query_row("SELECT id FROM grades WHERE id = ?", [&grade_id], |r| {
            r.get(0)
        })
        .optional();
    match grade_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "grade not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let existing: Result<Option<String>, _> = conn
        .query_row(
            "SELECT id FROM sections WHERE grade_id = ? AND name = ?",
            (&grade_id, &name),
            |r| r.get(0),
        )
        .optional();
    match existing {
        Ok(Some(_)) => {
            return err(
                &req.id,
                "duplicate_resource",
                format!("section {} already exists in that grade", name),
                Some(json!({ "name": name })),
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, grade_id, name) VALUES(?, ?, ?)",
        (&section_id, &grade_id, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "sectionId": section_id }))
}

fn handle_student_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let section_exists: Result<Option<String>, _> = conn
        .query_row("SELECT id FROM sections WHERE id = ?", [&section_id], |r| {
            r.get(0)
        })
        .optional();
    match section_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "section not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let sort_order = match next_sort_order(
        conn,
        "SELECT COUNT(*) FROM students WHERE section_id = ?",
        &[&section_id],
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, section_id, last_name, first_name, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&student_id, &section_id, &last_name, &first_name, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_subject_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let existing: Result<Option<String>, _> = conn
        .query_row("SELECT id FROM subjects WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional();
    match existing {
        Ok(Some(_)) => {
            return err(
                &req.id,
                "duplicate_resource",
                format!("subject {} already exists", name),
                Some(json!({ "name": name })),
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let sort_order = match next_sort_order(conn, "SELECT COUNT(*) FROM subjects", &[]) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, sort_order) VALUES(?, ?, ?)",
        (&subject_id, &name, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_directory(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let grades: Result<Vec<(String, String)>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare("SELECT id, name FROM grades ORDER BY sort_order")?;
        let out = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect();
        out
    })();
    let grades = match grades {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut out = Vec::new();
    for (grade_id, grade_name) in grades {
        let sections: Result<Vec<(String, String)>, rusqlite::Error> = (|| {
            let mut stmt = conn
                .prepare("SELECT id, name FROM sections WHERE grade_id = ? ORDER BY name")?;
            let out = stmt.query_map([&grade_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect();
            out
        })();
        let sections = match sections {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let mut section_nodes = Vec::new();
        for (section_id, section_name) in sections {
            let students: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
                let mut stmt = conn.prepare(
                    "SELECT id, last_name, first_name FROM students
                     WHERE section_id = ? ORDER BY sort_order, id",
                )?;
                let out = stmt.query_map([&section_id], |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "lastName": r.get::<_, String>(1)?,
                        "firstName": r.get::<_, String>(2)?,
                    }))
                })?
                .collect();
                out
            })();
            let students = match students {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            section_nodes.push(json!({
                "id": section_id,
                "name": section_name,
                "students": students,
            }));
        }

        out.push(json!({
            "id": grade_id,
            "name": grade_name,
            "sections": section_nodes,
        }));
    }

    ok(&req.id, json!({ "grades": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.gradeCreate" => Some(handle_grade_create(state, req)),
        "setup.sectionCreate" => Some(handle_section_create(state, req)),
        "setup.studentCreate" => Some(handle_student_create(state, req)),
        "setup.subjectCreate" => Some(handle_subject_create(state, req)),
        "setup.directory" => Some(handle_directory(state, req)),
        _ => None,
    }
}
