//! CLI integration tests

use std::process::Command;

fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-p", "vmdrain", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_cli_help() {
    let output = run_cli(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("plan"), "Should show plan command");
    assert!(stdout.contains("status"), "Should show status command");
    assert!(stdout.contains("check"), "Should show check command");
    assert!(stdout.contains("cache"), "Should show cache command");
    assert!(stdout.contains("--format"), "Should show format option");
}

#[test]
fn test_cli_version() {
    let output = run_cli(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("vmdrain"), "Should show binary name");
}

#[test]
fn test_plan_help() {
    let output = run_cli(&["plan", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Plan help should succeed");
    assert!(stdout.contains("--mode"), "Should show mode option");
    assert!(stdout.contains("--target"), "Should show target option");
    assert!(stdout.contains("--exclude"), "Should show exclude option");
    assert!(stdout.contains("--min-free-ram"), "Should show min-free-ram option");
    assert!(stdout.contains("evacuate-all"), "Should list evacuation mode");
}

#[test]
fn test_endpoint_env_is_documented() {
    let output = run_cli(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("VMDRAIN_ENDPOINT"), "Should show env var");
}

#[test]
fn test_plan_requires_source() {
    let output = run_cli(&["plan"]);
    assert!(!output.status.success(), "Missing source should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

#[test]
fn test_invalid_command() {
    let output = run_cli(&["defragment"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}
