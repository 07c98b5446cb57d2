use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn required_semester(req: &Request) -> Result<i64, HandlerErr> {
    let semester = req
        .params
        .get("semester")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing semester"))?;
    if semester != 1 && semester != 2 {
        return Err(HandlerErr::new("bad_params", "semester must be 1 or 2"));
    }
    Ok(semester)
}

fn required_f64(req: &Request, key: &str) -> Result<f64, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing numeric {}", key)))
}

/// The write boundary of the whole engine: marks and assessments accept
/// writes only while the owning TermStatus is open.
fn require_term_open(
    conn: &Connection,
    grade_id: &str,
    semester: i64,
    year_id: &str,
) -> Result<(), HandlerErr> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM term_statuses
             WHERE academic_year_id = ? AND grade_id = ? AND semester = ?",
            (year_id, grade_id, semester),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_failed)?;
    match status.as_deref() {
        Some("open") => Ok(()),
        Some(other) => Err(HandlerErr {
            code: "term_closed",
            message: format!("semester {} is {} for mark entry", semester, other),
            details: Some(json!({ "semester": semester, "status": other })),
        }),
        None => Err(HandlerErr::new(
            "not_found",
            "no term status for that grade, semester and year",
        )),
    }
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, String>(0))
        .optional()
        .map_err(db_failed)
        .map(|v| v.is_some())
}

fn handle_assessment_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let year_id = required_str(req, "yearId")?;
    let grade_id = required_str(req, "gradeId")?;
    let subject_id = required_str(req, "subjectId")?;
    let semester = required_semester(req)?;
    let title = required_str(req, "title")?;
    let out_of = required_f64(req, "outOf")?;
    if out_of < 0.0 {
        return Err(HandlerErr::new("bad_params", "outOf must not be negative"));
    }

    if !exists(conn, "SELECT id FROM academic_years WHERE id = ?", &year_id)? {
        return Err(HandlerErr::new("not_found", "academic year not found"));
    }
    if !exists(conn, "SELECT id FROM grades WHERE id = ?", &grade_id)? {
        return Err(HandlerErr::new("not_found", "grade not found"));
    }
    if !exists(conn, "SELECT id FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }
    require_term_open(conn, &grade_id, semester, &year_id)?;

    // The editable flag is stamped from the owning TermStatus, which the
    // boundary check above just proved open.
    let assessment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessments(id, academic_year_id, grade_id, subject_id, semester,
                                 title, out_of, is_editable, locked_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, NULL)",
        (
            &assessment_id,
            &year_id,
            &grade_id,
            &subject_id,
            semester,
            &title,
            out_of,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "assessmentId": assessment_id }))
}

fn handle_assessment_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let year_id = required_str(req, "yearId")?;
    let grade_id = required_str(req, "gradeId")?;
    let semester = required_semester(req)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, subject_id, title, out_of, is_editable, locked_at
             FROM assessments
             WHERE academic_year_id = ? AND grade_id = ? AND semester = ?
             ORDER BY title, id",
        )
        .map_err(db_failed)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map((&year_id, &grade_id, semester), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "outOf": r.get::<_, f64>(3)?,
                "isEditable": r.get::<_, i64>(4)? != 0,
                "lockedAt": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect())
        .map_err(db_failed)?;

    Ok(json!({ "assessments": rows }))
}

struct AssessmentScope {
    academic_year_id: String,
    grade_id: String,
    semester: i64,
    out_of: f64,
}

fn assessment_scope(conn: &Connection, assessment_id: &str) -> Result<AssessmentScope, HandlerErr> {
    conn.query_row(
        "SELECT academic_year_id, grade_id, semester, out_of
         FROM assessments WHERE id = ?",
        [assessment_id],
        |r| {
            Ok(AssessmentScope {
                academic_year_id: r.get(0)?,
                grade_id: r.get(1)?,
                semester: r.get(2)?,
                out_of: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(db_failed)?
    .ok_or_else(|| HandlerErr::new("not_found", "assessment not found"))
}

fn handle_mark_enter(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = required_str(req, "assessmentId")?;
    let student_id = required_str(req, "studentId")?;
    let score = required_f64(req, "score")?;

    let scope = assessment_scope(conn, &assessment_id)?;
    require_term_open(conn, &scope.grade_id, scope.semester, &scope.academic_year_id)?;

    if score < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "negative marks are not allowed".to_string(),
            details: Some(json!({ "score": score })),
        });
    }
    if score > scope.out_of {
        return Err(HandlerErr {
            code: "bad_params",
            message: "score exceeds the assessment maximum".to_string(),
            details: Some(json!({ "score": score, "outOf": scope.out_of })),
        });
    }

    let student_grade: Option<String> = conn
        .query_row(
            "SELECT sec.grade_id FROM students s
             JOIN sections sec ON sec.id = s.section_id
             WHERE s.id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_failed)?;
    match student_grade {
        None => return Err(HandlerErr::new("not_found", "student not found")),
        Some(g) if g != scope.grade_id => {
            return Err(HandlerErr::new(
                "bad_params",
                "student is not enrolled in the assessment's grade",
            ))
        }
        Some(_) => {}
    }

    // Lock flag stamped from the TermStatus the boundary check read: open,
    // therefore unlocked.
    let mark_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO marks(id, student_id, assessment_id, academic_year_id, grade_id,
                           semester, score, max_score, is_locked, locked_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 0, NULL)
         ON CONFLICT(assessment_id, student_id) DO UPDATE SET
           score = excluded.score,
           max_score = excluded.max_score",
        (
            &mark_id,
            &student_id,
            &assessment_id,
            &scope.academic_year_id,
            &scope.grade_id,
            scope.semester,
            score,
            scope.out_of,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "saved": true }))
}

fn handle_mark_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = required_str(req, "assessmentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, score, max_score, is_locked, locked_at
             FROM marks WHERE assessment_id = ?
             ORDER BY student_id",
        )
        .map_err(db_failed)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([&assessment_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "score": r.get::<_, f64>(1)?,
                "maxScore": r.get::<_, f64>(2)?,
                "isLocked": r.get::<_, i64>(3)? != 0,
                "lockedAt": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect())
        .map_err(db_failed)?;

    Ok(json!({ "marks": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&rusqlite::Connection, &Request) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "assessments.create" => handle_assessment_create,
            "assessments.list" => handle_assessment_list,
            "marks.enter" => handle_mark_enter,
            "marks.list" => handle_mark_list,
            _ => return None,
        };

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match handler(conn, req) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
