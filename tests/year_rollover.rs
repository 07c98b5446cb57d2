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

    fn request_err(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().expect("error object")
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn year_by_name(years: &Value, name: &str) -> Option<Value> {
    years["years"]
        .as_array()?
        .iter()
        .find(|y| y["name"].as_str() == Some(name))
        .cloned()
}

#[test]
fn closing_final_semester_of_active_year_rolls_over() {
    let mut d = Daemon::spawn();

    let year = d.request_ok(
        "years.create",
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-06-30" }),
    );
    let year_id = str_field(&year, "yearId");
    let _ = d.request_ok("years.activate", json!({ "yearId": year_id }));

    let grade = d.request_ok("setup.gradeCreate", json!({ "name": "Grade 9" }));
    let grade_id = str_field(&grade, "gradeId");
    let section = d.request_ok(
        "setup.sectionCreate",
        json!({ "gradeId": grade_id, "name": "A" }),
    );
    let section_id = str_field(&section, "sectionId");
    let x = str_field(
        &d.request_ok(
            "setup.studentCreate",
            json!({ "sectionId": section_id, "lastName": "Worku", "firstName": "Meron" }),
        ),
        "studentId",
    );
    let y = str_field(
        &d.request_ok(
            "setup.studentCreate",
            json!({ "sectionId": section_id, "lastName": "Zewdu", "firstName": "Abel" }),
        ),
        "studentId",
    );
    let subject = d.request_ok("setup.subjectCreate", json!({ "name": "Mathematics" }));
    let subject_id = str_field(&subject, "subjectId");

    // Semester 1: X averages 80, Y averages 30.
    let sem1 = json!({ "gradeId": grade_id, "semester": 1, "yearId": year_id });
    let _ = d.request_ok("terms.open", sem1.clone());
    let exam1 = str_field(
        &d.request_ok(
            "assessments.create",
            json!({
                "yearId": year_id,
                "gradeId": grade_id,
                "subjectId": subject_id,
                "semester": 1,
                "title": "Semester 1 exam",
                "outOf": 100,
            }),
        ),
        "assessmentId",
    );
    let _ = d.request_ok(
        "marks.enter",
        json!({ "assessmentId": exam1, "studentId": x, "score": 80 }),
    );
    let _ = d.request_ok(
        "marks.enter",
        json!({ "assessmentId": exam1, "studentId": y, "score": 30 }),
    );
    let _ = d.request_ok("terms.close", sem1);

    // Semester 2: X averages 40, Y averages 50.
    let sem2 = json!({ "gradeId": grade_id, "semester": 2, "yearId": year_id });
    let _ = d.request_ok("terms.open", sem2.clone());
    let exam2 = str_field(
        &d.request_ok(
            "assessments.create",
            json!({
                "yearId": year_id,
                "gradeId": grade_id,
                "subjectId": subject_id,
                "semester": 2,
                "title": "Semester 2 exam",
                "outOf": 100,
            }),
        ),
        "assessmentId",
    );
    let _ = d.request_ok(
        "marks.enter",
        json!({ "assessmentId": exam2, "studentId": x, "score": 40 }),
    );
    let _ = d.request_ok(
        "marks.enter",
        json!({ "assessmentId": exam2, "studentId": y, "score": 50 }),
    );

    let closed = d.request_ok("terms.close", sem2);
    assert_eq!(closed["finalized"].as_bool(), Some(true));
    assert_eq!(closed["rolloverYearName"].as_str(), Some("2026-2027"));
    let next_year_id = str_field(&closed, "rolloverYearId");

    // The next year: dates shifted one year, not current, nothing opened.
    let years = d.request_ok("years.list", json!({}));
    let next = year_by_name(&years, "2026-2027").expect("rolled-over year");
    assert_eq!(next["startDate"].as_str(), Some("2026-09-01"));
    assert_eq!(next["endDate"].as_str(), Some("2027-06-30"));
    assert_eq!(next["isCurrent"].as_bool(), Some(false));
    for semester in [1, 2] {
        let status = d.request_ok(
            "terms.status",
            json!({ "gradeId": grade_id, "semester": semester, "yearId": next_year_id }),
        );
        assert_eq!(status["status"].as_str(), Some("closed"));
    }

    // Creating the same name by hand is a validation error, not a second row.
    let error = d.request_err(
        "years.create",
        json!({ "name": "2026-2027", "startDate": "2026-09-01", "endDate": "2027-06-30" }),
    );
    assert_eq!(str_field(&error, "code"), "duplicate_resource");

    // Combined averages: X (80+40)/2 = 60 passed, Y (30+50)/2 = 40 failed.
    let final_x = d.request_ok(
        "results.final",
        json!({ "studentId": x, "yearId": year_id }),
    );
    assert_eq!(final_x["finalResult"]["combinedAverage"].as_f64(), Some(60.0));
    assert_eq!(
        final_x["finalResult"]["promotionStatus"].as_str(),
        Some("passed")
    );
    assert_eq!(final_x["finalResult"]["finalRank"].as_i64(), Some(1));

    let final_y = d.request_ok(
        "results.final",
        json!({ "studentId": y, "yearId": year_id }),
    );
    assert_eq!(final_y["finalResult"]["combinedAverage"].as_f64(), Some(40.0));
    assert_eq!(
        final_y["finalResult"]["promotionStatus"].as_str(),
        Some("failed")
    );
    assert_eq!(final_y["finalResult"]["finalRank"].as_i64(), Some(2));

    // Exactly one finalization event, handed over once.
    let drained = d.request_ok("events.drain", json!({}));
    let events = drained["events"].as_array().expect("events array");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["kind"].as_str(), Some("year_finalized"));
    assert_eq!(events[0]["gradeId"].as_str(), Some(grade_id.as_str()));

    let drained_again = d.request_ok("events.drain", json!({}));
    assert_eq!(
        drained_again["events"].as_array().map(|v| v.len()),
        Some(0)
    );
}

#[test]
fn rollover_happens_once_and_only_for_the_current_year() {
    let mut d = Daemon::spawn();

    let year = d.request_ok(
        "years.create",
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-06-30" }),
    );
    let year_id = str_field(&year, "yearId");
    let _ = d.request_ok("years.activate", json!({ "yearId": year_id }));

    let grade_a = str_field(
        &d.request_ok("setup.gradeCreate", json!({ "name": "Grade 9" })),
        "gradeId",
    );
    let grade_b = str_field(
        &d.request_ok("setup.gradeCreate", json!({ "name": "Grade 10" })),
        "gradeId",
    );

    // Semester 1 is closed by default, so semester 2 may open directly.
    let _ = d.request_ok(
        "terms.open",
        json!({ "gradeId": grade_a, "semester": 2, "yearId": year_id }),
    );
    let closed_a = d.request_ok(
        "terms.close",
        json!({ "gradeId": grade_a, "semester": 2, "yearId": year_id }),
    );
    assert_eq!(closed_a["rolloverYearName"].as_str(), Some("2026-2027"));
    let next_year_id = str_field(&closed_a, "rolloverYearId");

    // A second grade closing its final semester finds the year in place.
    let _ = d.request_ok(
        "terms.open",
        json!({ "gradeId": grade_b, "semester": 2, "yearId": year_id }),
    );
    let closed_b = d.request_ok(
        "terms.close",
        json!({ "gradeId": grade_b, "semester": 2, "yearId": year_id }),
    );
    assert!(closed_b["rolloverYearName"].is_null());

    // The rolled-over year is not current, so closing it rolls nothing over.
    let _ = d.request_ok(
        "terms.open",
        json!({ "gradeId": grade_a, "semester": 2, "yearId": next_year_id }),
    );
    let closed_next = d.request_ok(
        "terms.close",
        json!({ "gradeId": grade_a, "semester": 2, "yearId": next_year_id }),
    );
    assert!(closed_next["rolloverYearName"].is_null());

    let years = d.request_ok("years.list", json!({}));
    assert_eq!(years["years"].as_array().map(|v| v.len()), Some(2));
}

#[test]
fn activation_keeps_single_current_year() {
    let mut d = Daemon::spawn();

    let first = str_field(
        &d.request_ok(
            "years.create",
            json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-06-30" }),
        ),
        "yearId",
    );
    let second = str_field(
        &d.request_ok(
            "years.create",
            json!({ "name": "2026-2027", "startDate": "2026-09-01", "endDate": "2027-06-30" }),
        ),
        "yearId",
    );

    let _ = d.request_ok("years.activate", json!({ "yearId": first }));
    let _ = d.request_ok("years.activate", json!({ "yearId": second }));

    let years = d.request_ok("years.list", json!({}));
    let current: Vec<String> = years["years"]
        .as_array()
        .expect("years array")
        .iter()
        .filter(|y| y["isCurrent"].as_bool() == Some(true))
        .map(|y| str_field(y, "id"))
        .collect();
    assert_eq!(current, vec![second], "clear-then-set leaves one current");
}
