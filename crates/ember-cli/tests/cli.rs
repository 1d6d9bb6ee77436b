//! Driver behavior: output and exit codes

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

fn script(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

#[test]
fn test_runs_a_script() {
    let file = script("print 1 + 2;");
    Command::cargo_bin("ember")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout("3\n");
}

#[test]
fn test_compile_error_exits_65() {
    let file = script("var = 1;");
    Command::cargo_bin("ember")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("Error at"));
}

#[test]
fn test_runtime_error_exits_70() {
    let file = script("print nil + 1;");
    Command::cargo_bin("ember")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains(
            "[line 1] Operands must be two numbers or two strings.",
        ));
}

#[test]
fn test_missing_script_reports_and_fails() {
    Command::cargo_bin("ember")
        .unwrap()
        .arg("no-such-file.em")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to read script"));
}

#[test]
fn test_disasm_prints_bytecode_listing() {
    let file = script("print 1;");
    Command::cargo_bin("ember")
        .unwrap()
        .arg("--disasm")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("== <script> =="))
        .stdout(predicate::str::contains("Print"));
}

#[test]
fn test_json_diagnostics() {
    let file = script("print ;");
    Command::cargo_bin("ember")
        .unwrap()
        .arg("--json")
        .arg(file.path())
        .assert()
        .code(65)
        .stdout(predicate::str::contains("\"code\":\"EM2001\""));
}
