//! Integration tests for the `skippy` CLI against a throwaway project.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn skippy_bin(project: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_skippy"));
    cmd.arg("--project")
        .arg(project)
        .env_remove("SKIPPY_SNAPSHOT_PATH")
        .env_remove("SKIPPY_LOG")
        .env("NO_COLOR", "1");
    cmd
}

fn run(project: &Path, args: &[&str]) -> Output {
    skippy_bin(project)
        .args(args)
        .output()
        .expect("run skippy")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

// ── Helper: a project with one class root ───────────────────

struct Project {
    dir: TempDir,
}

impl Project {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        fs::write(
            dir.path().join("skippy.toml"),
            "[snapshot]\ndurable = false\n\n[fingerprint]\nclass_roots = [\"classes\"]\n",
        )
        .expect("write config");
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn unit(&self, name: &str, content: &str) {
        let mut path: PathBuf = self.root().join("classes");
        for part in name.split('.') {
            path.push(part);
        }
        path.set_extension("class");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn covered_file(&self, lines: &str) -> PathBuf {
        let path = self.root().join("covered.txt");
        fs::write(&path, lines).unwrap();
        path
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root().join(".skippy").join("snapshot.skippy")
    }

    fn record(&self, test: &str, covered: &str) -> Output {
        let file = self.covered_file(covered);
        run(
            self.root(),
            &["record", test, "--covered", file.to_str().unwrap()],
        )
    }

    fn decide(&self, test: &str) -> String {
        let out = run(self.root(), &["decide", test]);
        assert!(out.status.success(), "decide failed: {:?}", out);
        stdout(&out).trim().to_string()
    }
}

fn padder_project() -> Project {
    let project = Project::new();
    project.unit("com.example.LeftPadderTest", "test v1");
    project.unit("com.example.LeftPadder", "left v1");
    project.unit("com.example.RightPadder", "right v1");
    project
}

// ── decide / record lifecycle ───────────────────────────────

#[test]
fn unrecorded_test_runs() {
    let project = padder_project();
    assert_eq!(
        project.decide("com.example.LeftPadderTest#testPadLeft"),
        "RUN NO_PRIOR_RECORD"
    );
}

#[test]
fn recorded_test_skips_until_a_covered_unit_changes() {
    let project = padder_project();
    let out = project.record(
        "com.example.LeftPadderTest#testPadLeft",
        "com/example/LeftPadder\njava/lang/String\n",
    );
    assert!(out.status.success(), "{:?}", out);
    assert_eq!(
        stdout(&out).trim(),
        "recorded com.example.LeftPadderTest#testPadLeft: 1 units"
    );
    assert!(project.snapshot_path().exists());

    assert_eq!(
        project.decide("com.example.LeftPadderTest#testPadLeft"),
        "SKIP NO_RELEVANT_CHANGE"
    );

    project.unit("com.example.RightPadder", "right v2");
    assert_eq!(
        project.decide("com.example.LeftPadderTest#testPadLeft"),
        "SKIP NO_RELEVANT_CHANGE",
        "an unrelated unit must not flip the decision"
    );

    project.unit("com.example.LeftPadder", "left v2");
    assert_eq!(
        project.decide("com.example.LeftPadderTest#testPadLeft"),
        "RUN DEPENDENCY_CHANGED(com.example.LeftPadder)"
    );

    project.unit("com.example.LeftPadderTest", "test v2");
    assert_eq!(
        project.decide("com.example.LeftPadderTest#testPadLeft"),
        "RUN TEST_CLASS_CHANGED"
    );
}

#[test]
fn record_reads_covered_units_from_stdin() {
    let project = padder_project();
    let mut child = skippy_bin(project.root())
        .args(["record", "com.example.LeftPadderTest#testPadLeft", "--covered", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn skippy");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"com.example.LeftPadder\n")
        .unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());

    assert_eq!(
        project.decide("com.example.LeftPadderTest#testPadLeft"),
        "SKIP NO_RELEVANT_CHANGE"
    );
}

#[test]
fn class_decision_covers_every_method() {
    let project = padder_project();
    project.record("com.example.LeftPadderTest#a", "com.example.LeftPadder\n");
    project.record("com.example.LeftPadderTest#b", "com.example.RightPadder\n");

    let decide_class = |project: &Project| {
        let out = run(
            project.root(),
            &["decide", "--class", "com.example.LeftPadderTest"],
        );
        stdout(&out).trim().to_string()
    };
    assert_eq!(decide_class(&project), "SKIP NO_RELEVANT_CHANGE");

    project.unit("com.example.RightPadder", "right v2");
    assert_eq!(
        decide_class(&project),
        "RUN DEPENDENCY_CHANGED(com.example.RightPadder)"
    );
}

#[test]
fn decide_json_is_machine_readable() {
    let project = padder_project();
    let out = run(project.root(), &["decide", "p.T#a", "--json"]);
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["decision"], "RUN");
    assert_eq!(value["reason"], "NO_PRIOR_RECORD");
}

#[test]
fn malformed_test_id_is_rejected() {
    let project = padder_project();
    let out = run(project.root(), &["decide", "Broken#"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid test id"));
}

// ── corruption ──────────────────────────────────────────────

#[test]
fn zero_byte_snapshot_degrades_to_run_everything() {
    let project = padder_project();
    project.record("com.example.LeftPadderTest#a", "com.example.LeftPadder\n");
    fs::write(project.snapshot_path(), b"").unwrap();

    assert_eq!(
        project.decide("com.example.LeftPadderTest#a"),
        "RUN NO_PRIOR_RECORD"
    );

    let show = run(project.root(), &["show"]);
    assert!(!show.status.success(), "show must surface corruption");
    assert!(String::from_utf8_lossy(&show.stderr).contains("corrupt snapshot"));
}

#[test]
fn recording_over_a_corrupt_snapshot_repairs_it() {
    let project = padder_project();
    fs::create_dir_all(project.snapshot_path().parent().unwrap()).unwrap();
    fs::write(project.snapshot_path(), b"skippy-snapshot v1\n{\"tests\"").unwrap();

    let out = project.record("com.example.LeftPadderTest#a", "com.example.LeftPadder\n");
    assert!(out.status.success());
    assert!(run(project.root(), &["show"]).status.success());
}

// ── inspection commands ─────────────────────────────────────

#[test]
fn show_json_contains_records() {
    let project = padder_project();
    project.record("com.example.LeftPadderTest#a", "com.example.LeftPadder\n");

    let out = run(project.root(), &["show", "--json"]);
    assert!(out.status.success());
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let record = &value["tests"]["com.example.LeftPadderTest#a"];
    assert_eq!(record["test_class"], "com.example.LeftPadderTest");
    assert!(record["covered"]["com.example.LeftPadder"].is_string());
    assert!(value["classes"]["com.example.LeftPadder"].is_object());
}

#[test]
fn impacted_lists_tests_covering_a_unit() {
    let project = padder_project();
    project.record("com.example.LeftPadderTest#a", "com.example.LeftPadder\n");
    project.record("com.example.LeftPadderTest#b", "com.example.RightPadder\n");

    let out = run(project.root(), &["impacted", "com.example.RightPadder"]);
    assert_eq!(stdout(&out), "com.example.LeftPadderTest#b\n");

    let none = run(project.root(), &["impacted", "com.example.Nothing"]);
    assert!(stdout(&none).contains("No recorded test covers"));
}

#[test]
fn status_reports_runs_and_skips() {
    let project = padder_project();
    project.record("com.example.LeftPadderTest#a", "com.example.LeftPadder\n");
    project.record("com.example.LeftPadderTest#b", "com.example.RightPadder\n");
    project.unit("com.example.LeftPadder", "left v2");

    let out = run(project.root(), &["status"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("1 changed"), "{text}");
    assert!(text.contains("com.example.LeftPadderTest#a"), "{text}");
    assert!(text.contains("1 to run, 1 to skip"), "{text}");

    let json = run(project.root(), &["status", "--json"]);
    let value: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(value["delta"]["changed"], 1);
    assert_eq!(value["tests"].as_array().unwrap().len(), 2);
}

#[test]
fn fingerprint_lists_units_under_class_roots() {
    let project = padder_project();
    project.unit("com.example.Uses", "import com.example.LeftPadder;\n");

    let all = stdout(&run(project.root(), &["fingerprint"]));
    assert_eq!(all.lines().count(), 4, "{all}");

    let one = stdout(&run(project.root(), &["fingerprint", "com.example.Uses"]));
    assert!(one.contains("-> com.example.LeftPadder"), "{one}");

    let missing = stdout(&run(project.root(), &["fingerprint", "com.example.Gone"]));
    assert!(missing.contains("unknown"));
}

#[test]
fn clean_removes_the_snapshot() {
    let project = padder_project();
    project.record("com.example.LeftPadderTest#a", "com.example.LeftPadder\n");

    let out = run(project.root(), &["clean"]);
    assert!(stdout(&out).starts_with("Removed"));
    assert!(!project.snapshot_path().exists());

    let again = run(project.root(), &["clean"]);
    assert!(stdout(&again).starts_with("No snapshot"));
}

#[test]
fn snapshot_path_env_override_wins() {
    let project = padder_project();
    let elsewhere = project.root().join("elsewhere.skippy");
    let file = project.covered_file("com.example.LeftPadder\n");

    let out = skippy_bin(project.root())
        .env("SKIPPY_SNAPSHOT_PATH", &elsewhere)
        .args(["record", "p.T#a", "--covered", file.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(elsewhere.exists());
    assert!(!project.snapshot_path().exists());
}

#[test]
fn config_prints_effective_settings() {
    let project = padder_project();
    let out = run(project.root(), &["config"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("class_roots"), "{text}");
    assert!(text.contains("max_retries = 3"), "{text}");
}
