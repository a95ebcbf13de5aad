use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_dry_run_writes_program_to_stdout() {
    Command::cargo_bin("urtrace")
        .unwrap()
        .args([
            "trace",
            "-t",
            "/bin/target-app",
            "--dry-run",
            "-o",
            "-",
            "*0xdeadbeef; pid=$pid; {print(pid)};",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("from bcc import BPF"))
        .stdout(predicate::str::contains(
            "b.attach_uprobe(name='/bin/target-app', addr=0xdeadbeef, fn_name='trace_probe0')",
        ));
}

#[test]
fn test_dry_run_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("trace.bcc.py");

    Command::cargo_bin("urtrace")
        .unwrap()
        .args([
            "trace",
            "-t",
            "/bin/target-app",
            "--dry-run",
            "-o",
            output.to_str().unwrap(),
            "*0x10; tid=$tid; {print(tid)};",
        ])
        .assert()
        .success();

    let rendered = std::fs::read_to_string(&output).unwrap();
    assert!(rendered.contains("u32 tid;"));
}

#[test]
fn test_program_file_flag() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("probes.rrr");
    std::fs::write(&program, "*0x10; c=$comm; {print(c)};").unwrap();

    Command::cargo_bin("urtrace")
        .unwrap()
        .args([
            "trace",
            "-t",
            "/bin/target-app",
            "--dry-run",
            "-o",
            "-",
            "-f",
            program.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("char comm[16];"));
}

#[test]
fn test_missing_program_fails() {
    Command::cargo_bin("urtrace")
        .unwrap()
        .args(["trace", "-t", "/bin/target-app", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid program"));
}

#[test]
fn test_missing_tracee_flag_fails() {
    Command::cargo_bin("urtrace")
        .unwrap()
        .args(["trace", "*0x1; pid=$pid; {print(pid)};"])
        .assert()
        .failure();
}

#[test]
fn test_real_target_extra_overrides_attach_path() {
    Command::cargo_bin("urtrace")
        .unwrap()
        .args([
            "trace",
            "-t",
            "/bin/target-app",
            "-e",
            "real_target=/opt/actual-binary",
            "--dry-run",
            "-o",
            "-",
            "*0x10; pid=$pid; {print(pid)};",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("name='/opt/actual-binary'"));
}

#[test]
fn test_unknown_extra_fails() {
    Command::cargo_bin("urtrace")
        .unwrap()
        .args([
            "trace",
            "-t",
            "/bin/target-app",
            "-e",
            "bogus=1",
            "--dry-run",
            "-o",
            "-",
            "*0x10; pid=$pid; {print(pid)};",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid extra"));
}
