use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Results are declared at 2-decimal precision everywhere: subject
/// percentages, semester averages, and combined yearly averages.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn db_err(e: impl std::fmt::Display) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// `100 * sum(score) / sum(max_score)` for one subject, or `None` when the
/// subject has no marks worth counting (`sum(max_score) == 0`) and must not
/// enter the semester average.
pub fn subject_percentage(sum_score: f64, sum_max: f64) -> Option<f64> {
    if sum_max > 0.0 {
        Some(round2(100.0 * sum_score / sum_max))
    } else {
        None
    }
}

/// Mean of the subject percentages that carried data; 0 for a student with
/// no marks at all.
pub fn semester_average(percentages: &[f64]) -> f64 {
    if percentages.is_empty() {
        return 0.0;
    }
    round2(percentages.iter().sum::<f64>() / percentages.len() as f64)
}

/// Mean of the two semester averages; a semester with no result row reads
/// as 0 at the call site.
pub fn combined_average(avg1: f64, avg2: f64) -> f64 {
    round2((avg1 + avg2) / 2.0)
}

pub fn promotion_status(combined: f64, threshold: f64) -> &'static str {
    if combined >= threshold {
        "passed"
    } else {
        "failed"
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
    pub id: String,
    pub score: f64,
    pub rank: i64,
}

impl RankEntry {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
            rank: 0,
        }
    }
}

/// Dense 1-based sequential ranks, descending by score. Ties get consecutive
/// distinct ranks; the id tiebreak keeps reruns bit-identical.
pub fn assign_ranks(entries: &mut [RankEntry]) {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    for (i, e) in entries.iter_mut().enumerate() {
        e.rank = (i + 1) as i64;
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
}

fn section_student_ids(ctx: &CalcContext<'_>, section_id: &str) -> Result<Vec<String>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare("SELECT id FROM students WHERE section_id = ? ORDER BY sort_order, id")
        .map_err(db_err)?;
    stmt.query_map([section_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

fn scope_section_ids(
    ctx: &CalcContext<'_>,
    grade_id: Option<&str>,
) -> Result<Vec<String>, CalcError> {
    let (sql, params): (&str, Vec<String>) = match grade_id {
        Some(g) => (
            "SELECT id FROM sections WHERE grade_id = ? ORDER BY name, id",
            vec![g.to_string()],
        ),
        None => (
            "SELECT id FROM sections ORDER BY grade_id, name, id",
            Vec::new(),
        ),
    };
    let mut stmt = ctx.conn.prepare(sql).map_err(db_err)?;
    stmt.query_map(rusqlite::params_from_iter(params), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

/// Full recomputation of SemesterResult rows for (year, semester), one
/// section at a time; `grade_id` narrows the pass to the grade a close
/// transition covers. Idempotent: unchanged marks produce identical rows.
pub fn aggregate_semester(
    ctx: &CalcContext<'_>,
    year_id: &str,
    semester: i64,
    grade_id: Option<&str>,
) -> Result<usize, CalcError> {
    let mut upserted = 0;
    for section_id in scope_section_ids(ctx, grade_id)? {
        upserted += aggregate_section(ctx, &section_id, year_id, semester)?;
    }
    Ok(upserted)
}

fn aggregate_section(
    ctx: &CalcContext<'_>,
    section_id: &str,
    year_id: &str,
    semester: i64,
) -> Result<usize, CalcError> {
    let conn = ctx.conn;
    let students = section_student_ids(ctx, section_id)?;
    if students.is_empty() {
        return Ok(0);
    }

    // Per-student per-subject mark totals for the scope.
    let mut stmt = conn
        .prepare(
            "SELECT m.student_id, a.subject_id, SUM(m.score), SUM(m.max_score)
             FROM marks m
             JOIN assessments a ON a.id = m.assessment_id
             JOIN students s ON s.id = m.student_id
             WHERE s.section_id = ? AND m.academic_year_id = ? AND m.semester = ?
             GROUP BY m.student_id, a.subject_id",
        )
        .map_err(db_err)?;
    let totals = stmt
        .query_map((section_id, year_id, semester), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut percentages: HashMap<String, Vec<f64>> = HashMap::new();
    for (student_id, sum_score, sum_max) in totals {
        if let Some(pct) = subject_percentage(sum_score, sum_max) {
            percentages.entry(student_id).or_default().push(pct);
        }
    }

    let mut entries: Vec<RankEntry> = Vec::with_capacity(students.len());
    for student_id in &students {
        let average = semester_average(
            percentages
                .get(student_id)
                .map(|v| v.as_slice())
                .unwrap_or(&[]),
        );
        conn.execute(
            "INSERT INTO semester_results(student_id, academic_year_id, semester, section_id, average, rank)
             VALUES(?, ?, ?, ?, ?, 0)
             ON CONFLICT(student_id, academic_year_id, semester) DO UPDATE SET
               section_id = excluded.section_id,
               average = excluded.average,
               rank = 0",
            (student_id, year_id, semester, section_id, average),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
        entries.push(RankEntry::new(student_id.clone(), average));
    }

    assign_ranks(&mut entries);
    for entry in &entries {
        conn.execute(
            "UPDATE semester_results SET rank = ?
             WHERE student_id = ? AND academic_year_id = ? AND semester = ?",
            (entry.rank, &entry.id, year_id, semester),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    }

    Ok(entries.len())
}

/// Combine both semester averages into FinalResult rows for every student of
/// every section in the grade, then rank each section on the combined
/// average. Safe to re-run.
pub fn finalize_year(
    ctx: &CalcContext<'_>,
    year_id: &str,
    grade_id: &str,
    threshold: f64,
) -> Result<usize, CalcError> {
    let conn = ctx.conn;
    let mut upserted = 0;

    for section_id in scope_section_ids(ctx, Some(grade_id))? {
        let students = section_student_ids(ctx, &section_id)?;
        if students.is_empty() {
            continue;
        }

        let mut entries: Vec<RankEntry> = Vec::with_capacity(students.len());
        for student_id in &students {
            let avg1 = semester_result_average(conn, student_id, year_id, 1)?;
            let avg2 = semester_result_average(conn, student_id, year_id, 2)?;
            let combined = combined_average(avg1.unwrap_or(0.0), avg2.unwrap_or(0.0));
            let status = promotion_status(combined, threshold);

            conn.execute(
                "INSERT INTO final_results(student_id, academic_year_id, section_id,
                                           combined_average, promotion_status, final_rank)
                 VALUES(?, ?, ?, ?, ?, 0)
                 ON CONFLICT(student_id, academic_year_id) DO UPDATE SET
                   section_id = excluded.section_id,
                   combined_average = excluded.combined_average,
                   promotion_status = excluded.promotion_status,
                   final_rank = 0",
                (student_id, year_id, &section_id, combined, status),
            )
            .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
            entries.push(RankEntry::new(student_id.clone(), combined));
        }

        assign_ranks(&mut entries);
        for entry in &entries {
            conn.execute(
                "UPDATE final_results SET final_rank = ?
                 WHERE student_id = ? AND academic_year_id = ?",
                (entry.rank, &entry.id, year_id),
            )
            .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
        }
        upserted += entries.len();
    }

    Ok(upserted)
}

fn semester_result_average(
    conn: &Connection,
    student_id: &str,
    year_id: &str,
    semester: i64,
) -> Result<Option<f64>, CalcError> {
    conn.query_row(
        "SELECT average FROM semester_results
         WHERE student_id = ? AND academic_year_id = ? AND semester = ?",
        (student_id, year_id, semester),
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err)
}

/// Section+subject scoped ranking computed straight from marks; the same
/// assigner the semester and final ranks use, pointed at a different metric.
pub fn subject_ranking(
    ctx: &CalcContext<'_>,
    section_id: &str,
    subject_id: &str,
    year_id: &str,
    semester: i64,
) -> Result<Vec<RankEntry>, CalcError> {
    let conn = ctx.conn;
    let students = section_student_ids(ctx, section_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT m.student_id, SUM(m.score), SUM(m.max_score)
             FROM marks m
             JOIN assessments a ON a.id = m.assessment_id
             JOIN students s ON s.id = m.student_id
             WHERE s.section_id = ? AND a.subject_id = ?
               AND m.academic_year_id = ? AND m.semester = ?
             GROUP BY m.student_id",
        )
        .map_err(db_err)?;
    let totals = stmt
        .query_map((section_id, subject_id, year_id, semester), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut by_student: HashMap<String, f64> = HashMap::new();
    for (student_id, sum_score, sum_max) in totals {
        if let Some(pct) = subject_percentage(sum_score, sum_max) {
            by_student.insert(student_id, pct);
        }
    }

    let mut entries: Vec<RankEntry> = students
        .into_iter()
        .map(|id| {
            let pct = by_student.get(&id).copied().unwrap_or(0.0);
            RankEntry::new(id, pct)
        })
        .collect();
    assign_ranks(&mut entries);
    Ok(entries)
}
