use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct Daemon {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: u64,
    _workspace: tempfile::TempDir,
}

impl Daemon {
    fn spawn() -> Self {
        let workspace = tempfile::tempdir().expect("create temp workspace");
        let exe = env!("CARGO_BIN_EXE_registrard");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn registrard");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        let mut daemon = Self {
            _child: child,
            stdin,
            reader: BufReader::new(stdout),
            seq: 0,
            _workspace: workspace,
        };
        let path = daemon._workspace.path().to_string_lossy().to_string();
        daemon.request_ok("workspace.select", json!({ "path": path }));
        daemon
    }

    fn request(&mut self, method: &str, params: Value) -> Value {
        self.seq += 1;
        let id = self.seq.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn request_ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct School {
    year_id: String,
    grade_id: String,
    section_id: String,
}

fn seed_school(d: &mut Daemon) -> School {
    let year = d.request_ok(
        "years.create",
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-06-30" }),
    );
    let year_id = str_field(&year, "yearId");
    let grade = d.request_ok("setup.gradeCreate", json!({ "name": "Grade 9" }));
    let grade_id = str_field(&grade, "gradeId");
    let section = d.request_ok(
        "setup.sectionCreate",
        json!({ "gradeId": grade_id, "name": "A" }),
    );
    let section_id = str_field(&section, "sectionId");
    School {
        year_id,
        grade_id,
        section_id,
    }
}

fn seed_student(d: &mut Daemon, section_id: &str, last: &str, first: &str) -> String {
    let v = d.request_ok(
        "setup.studentCreate",
        json!({ "sectionId": section_id, "lastName": last, "firstName": first }),
    );
    str_field(&v, "studentId")
}

fn enter_mark(d: &mut Daemon, assessment_id: &str, student_id: &str, score: f64) {
    let _ = d.request_ok(
        "marks.enter",
        json!({ "assessmentId": assessment_id, "studentId": student_id, "score": score }),
    );
}

#[test]
fn section_ranks_form_gapless_descending_permutation() {
    let mut d = Daemon::spawn();
    let school = seed_school(&mut d);
    let a = seed_student(&mut d, &school.section_id, "Assefa", "Marta");
    let b = seed_student(&mut d, &school.section_id, "Bekele", "Samuel");
    let c = seed_student(&mut d, &school.section_id, "Chala", "Lidya");
    let e = seed_student(&mut d, &school.section_id, "Eshete", "Biruk");

    let key = json!({ "gradeId": school.grade_id, "semester": 1, "yearId": school.year_id });
    let _ = d.request_ok("terms.open", key.clone());

    let subject = d.request_ok("setup.subjectCreate", json!({ "name": "Mathematics" }));
    let subject_id = str_field(&subject, "subjectId");
    let exam = d.request_ok(
        "assessments.create",
        json!({
            "yearId": school.year_id,
            "gradeId": school.grade_id,
            "subjectId": subject_id,
            "semester": 1,
            "title": "Final",
            "outOf": 100,
        }),
    );
    let exam_id = str_field(&exam, "assessmentId");

    // Two students tied on 70: consecutive distinct ranks, no gaps.
    enter_mark(&mut d, &exam_id, &a, 90.0);
    enter_mark(&mut d, &exam_id, &b, 70.0);
    enter_mark(&mut d, &exam_id, &c, 70.0);
    enter_mark(&mut d, &exam_id, &e, 50.0);

    let _ = d.request_ok("terms.close", key);

    let listing = d.request_ok(
        "results.section",
        json!({ "sectionId": school.section_id, "yearId": school.year_id, "semester": 1 }),
    );
    let rows = listing["results"].as_array().expect("results array");
    assert_eq!(rows.len(), 4);

    let ranks: Vec<i64> = rows
        .iter()
        .map(|r| r["rank"].as_i64().expect("rank"))
        .collect();
    assert_eq!(ranks, vec![1, 2, 3, 4], "dense 1..N in listing order");

    let averages: Vec<f64> = rows
        .iter()
        .map(|r| r["average"].as_f64().expect("average"))
        .collect();
    for pair in averages.windows(2) {
        assert!(pair[0] >= pair[1], "averages non-increasing by rank");
    }
    assert_eq!(averages, vec![90.0, 70.0, 70.0, 50.0]);

    let tied: Vec<String> = rows
        .iter()
        .filter(|r| r["average"].as_f64() == Some(70.0))
        .map(|r| str_field(r, "studentId"))
        .collect();
    assert_eq!(tied.len(), 2);
    assert!(tied.contains(&b) && tied.contains(&c));
}

#[test]
fn subject_ranking_trend_tracks_semester_change() {
    let mut d = Daemon::spawn();
    let school = seed_school(&mut d);
    let a = seed_student(&mut d, &school.section_id, "Fikre", "Selam");
    let b = seed_student(&mut d, &school.section_id, "Gemechu", "Nahom");

    let subject = d.request_ok("setup.subjectCreate", json!({ "name": "Mathematics" }));
    let subject_id = str_field(&subject, "subjectId");

    let sem1 = json!({ "gradeId": school.grade_id, "semester": 1, "yearId": school.year_id });
    let _ = d.request_ok("terms.open", sem1.clone());
    let exam1 = d.request_ok(
        "assessments.create",
        json!({
            "yearId": school.year_id,
            "gradeId": school.grade_id,
            "subjectId": subject_id,
            "semester": 1,
            "title": "Midterm",
            "outOf": 100,
        }),
    );
    let exam1_id = str_field(&exam1, "assessmentId");
    enter_mark(&mut d, &exam1_id, &a, 90.0);
    enter_mark(&mut d, &exam1_id, &b, 50.0);
    let _ = d.request_ok("terms.close", sem1);

    let sem2 = json!({ "gradeId": school.grade_id, "semester": 2, "yearId": school.year_id });
    let _ = d.request_ok("terms.open", sem2);
    let exam2 = d.request_ok(
        "assessments.create",
        json!({
            "yearId": school.year_id,
            "gradeId": school.grade_id,
            "subjectId": subject_id,
            "semester": 2,
            "title": "Midterm",
            "outOf": 100,
        }),
    );
    let exam2_id = str_field(&exam2, "assessmentId");
    enter_mark(&mut d, &exam2_id, &a, 40.0);
    enter_mark(&mut d, &exam2_id, &b, 80.0);

    // Semester 1 has nothing to compare against.
    let first = d.request_ok(
        "results.subjectRanking",
        json!({
            "sectionId": school.section_id,
            "subjectId": subject_id,
            "yearId": school.year_id,
            "semester": 1,
        }),
    );
    for row in first["ranking"].as_array().expect("ranking array") {
        assert_eq!(row["trend"].as_str(), Some("new"));
    }

    // Semester 2 is a comparison of two ranking runs, not its own path.
    let second = d.request_ok(
        "results.subjectRanking",
        json!({
            "sectionId": school.section_id,
            "subjectId": subject_id,
            "yearId": school.year_id,
            "semester": 2,
        }),
    );
    let rows = second["ranking"].as_array().expect("ranking array");
    assert_eq!(rows.len(), 2);
    for row in rows {
        let student = str_field(row, "studentId");
        if student == b {
            assert_eq!(row["rank"].as_i64(), Some(1));
            assert_eq!(row["trend"].as_str(), Some("up"));
            assert_eq!(row["percentage"].as_f64(), Some(80.0));
        } else {
            assert_eq!(student, a);
            assert_eq!(row["rank"].as_i64(), Some(2));
            assert_eq!(row["trend"].as_str(), Some("down"));
            assert_eq!(row["percentage"].as_f64(), Some(40.0));
        }
    }
}
