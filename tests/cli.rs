use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

fn vtpatch() -> Command {
    let mut cmd = Command::cargo_bin("vtpatch").unwrap();
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn apply_and_rollback_from_stdin() {
    let repo = tempdir().unwrap();
    fs::write(repo.path().join("a.py"), "foo\n").unwrap();

    let output = vtpatch()
        .arg("--repo")
        .arg(repo.path())
        .args(["apply", "--id", "cli1"])
        .write_stdin("--- a/a.py\n+++ b/a.py\n@@ -1 +1 @@\n-foo\n+bar\n")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Applied\n");
    assert_eq!(fs::read_to_string(repo.path().join("a.py")).unwrap(), "bar\n");

    let output = vtpatch()
        .arg("--repo")
        .arg(repo.path())
        .args(["rollback", "cli1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(fs::read_to_string(repo.path().join("a.py")).unwrap(), "foo\n");
}

#[test]
fn rejected_diff_exits_non_zero_with_json() {
    let repo = tempdir().unwrap();
    let diff = repo.path().join("bad.diff");
    fs::write(&diff, "--- /etc/passwd\n+++ /etc/passwd\n@@ -1 +1 @@\n-a\n+b\n").unwrap();

    let output = vtpatch()
        .arg("--repo")
        .arg(repo.path())
        .arg("--json")
        .args(["apply", "--id", "cli2"])
        .arg(&diff)
        .output()
        .unwrap();
    assert!(!output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["success"], false);
    assert!(value["message"].as_str().unwrap().starts_with("Security: "));
}

#[test]
fn search_prints_path_line_and_text() {
    let repo = tempdir().unwrap();
    fs::write(repo.path().join("m.py"), "x = 1\nimport os\n").unwrap();

    let output = vtpatch()
        .arg("--repo")
        .arg(repo.path())
        .args(["search", "^import"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "m.py:2:import os\n");
}
