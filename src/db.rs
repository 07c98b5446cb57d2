use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("registrar.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(grade_id, name),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_grade ON sections(grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON students(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_statuses(
            academic_year_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            semester INTEGER NOT NULL CHECK(semester IN (1, 2)),
            status TEXT NOT NULL CHECK(status IN ('open', 'closed')),
            is_declared INTEGER NOT NULL DEFAULT 0,
            opened_at TEXT,
            closed_at TEXT,
            opened_by TEXT,
            closed_by TEXT,
            PRIMARY KEY(academic_year_id, grade_id, semester),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_statuses_year ON term_statuses(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            semester INTEGER NOT NULL CHECK(semester IN (1, 2)),
            title TEXT NOT NULL,
            out_of REAL NOT NULL,
            is_editable INTEGER NOT NULL,
            locked_at TEXT,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_scope
         ON assessments(academic_year_id, grade_id, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_subject ON assessments(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            assessment_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            semester INTEGER NOT NULL CHECK(semester IN (1, 2)),
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            is_locked INTEGER NOT NULL,
            locked_at TEXT,
            UNIQUE(assessment_id, student_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_scope
         ON marks(academic_year_id, grade_id, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_results(
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL CHECK(semester IN (1, 2)),
            section_id TEXT NOT NULL,
            average REAL NOT NULL,
            rank INTEGER NOT NULL,
            PRIMARY KEY(student_id, academic_year_id, semester),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semester_results_section
         ON semester_results(section_id, academic_year_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_results(
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            combined_average REAL NOT NULL,
            promotion_status TEXT NOT NULL CHECK(promotion_status IN ('passed', 'failed')),
            final_rank INTEGER NOT NULL,
            PRIMARY KEY(student_id, academic_year_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_results_section
         ON final_results(section_id, academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_events(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            consumed INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_result_events_consumed ON result_events(consumed)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Workspaces created before the transition audit columns landed lack the
    // actor fields. Add them on open.
    ensure_term_statuses_actor_columns(&conn)?;

    Ok(conn)
}

fn ensure_term_statuses_actor_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "term_statuses", "opened_by")? {
        conn.execute("ALTER TABLE term_statuses ADD COLUMN opened_by TEXT", [])?;
    }
    if !table_has_column(conn, "term_statuses", "closed_by")? {
        conn.execute("ALTER TABLE term_statuses ADD COLUMN closed_by TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}
