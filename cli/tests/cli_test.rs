#![cfg(feature = "integ")]
use assert_cmd::Command;
use std::path::PathBuf;

/// The chart checked out next to this workspace, as laid out in the kapparmor repository.
fn chart_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../charts/kapparmor")
        .canonicalize()
        .unwrap()
}

/// We will test:
/// `kapparmor-e2e --skip-build --run case2` against the local MicroK8s host
/// The run log is written where `--log-file` points
#[test]
fn profile_in_use_scenario() {
    let dir = tempfile_dir();
    let log_file = dir.join("e2e.log");
    let mut cmd = Command::cargo_bin("kapparmor-e2e").unwrap();
    cmd.args(&[
        "--skip-build",
        "--run",
        "case2",
        "--chart",
        chart_path().to_str().unwrap(),
        "--log-file",
        log_file.to_str().unwrap(),
    ]);
    cmd.assert().success();
    let log = std::fs::read_to_string(&log_file).unwrap();
    assert!(log.contains("[SECTION] TEST CASE 2: Profile In-Use"));
    assert!(log.contains("Total: 1 | Passed: 1 | Failed: 0"));
}

#[test]
fn rejects_unknown_scenario() {
    let mut cmd = Command::cargo_bin("kapparmor-e2e").unwrap();
    cmd.args(&["--run", "case9"]);
    cmd.assert().failure();
}

fn tempfile_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kapparmor-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
