//! CLI integration tests for dbslice.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for errors raised before any query runs.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the dbslice binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("dbslice").unwrap();
    cmd.env_remove("DBSLICE_TEST_URL");
    cmd
}

/// Write a profile reading its URL from DBSLICE_TEST_URL.
fn profile_file(extra: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "database:\n  url_env: DBSLICE_TEST_URL\n  connect_timeout_secs: 2\nroots:\n  - name: stores\n    table: store\n    selector: {{ mode: list, ids: [1] }}\nfamilies:\n  - name: shop\n    root: {{ table: store, selection: stores }}\n{}",
        extra
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("neuter"))
        .stdout(predicate::str::contains("reset"))
        .stdout(predicate::str::contains("swap"))
        .stdout(predicate::str::contains("unswap"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("audit-sequences"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--restart"))
        .stdout(predicate::str::contains("--precopy-only"))
        .stdout(predicate::str::contains("--families"));
}

#[test]
fn test_precopy_only_conflicts_with_families() {
    cmd()
        .args(["run", "--precopy-only", "--families", "shop"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_reconcile_help() {
    cmd()
        .args(["reconcile", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--phase"))
        .stdout(predicate::str::contains("--table"));
}

#[test]
fn test_reconcile_rejects_copy_phase() {
    cmd()
        .args(["reconcile", "--phase", "index,load"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("load is not a reconcile phase"));
}

#[test]
fn test_reconcile_rejects_unknown_phase() {
    cmd()
        .args(["reconcile", "--phase", "vacuum"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown phase 'vacuum'"));
}

#[test]
fn test_neuter_and_reset_help() {
    cmd()
        .args(["neuter", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--tables"));
    cmd()
        .args(["reset", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--families"));
}

#[test]
fn test_reset_requires_families() {
    cmd()
        .arg("reset")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--families"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dbslice"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_exist() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--env"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--fanout-parallel"))
        .stdout(predicate::str::contains("--validate-parallel"))
        .stdout(predicate::str::contains("--skip-validate-fk"));
}

#[test]
fn test_shutdown_timeout_default() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"));
}

#[test]
fn test_log_flags_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: profile.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_profile.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_profile_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_profile.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "roots: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_profile_without_work_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source_schema: public").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("defines no roots"));
}

#[test]
fn test_protected_dest_schema_exits_with_code_1() {
    let file = profile_file("dest_schema: public\n");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("dest_schema"));
}

#[test]
fn test_missing_url_variable_exits_with_code_1() {
    let file = profile_file("");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run", "--dry-run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("DBSLICE_TEST_URL"));
}

#[test]
fn test_missing_env_file_exits_with_code_1() {
    let file = profile_file("");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--env",
            "nonexistent.env",
            "audit",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("nonexistent.env"));
}

#[test]
fn test_zero_parallelism_exits_with_code_1() {
    let file = profile_file("");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--fanout-parallel",
            "0",
            "run",
        ])
        .env("DBSLICE_TEST_URL", "postgres://dbslice@127.0.0.1:1/dbslice")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("parallelism"));
}

#[test]
fn test_url_from_env_file_is_used() {
    let file = profile_file("");
    let mut env = tempfile::NamedTempFile::new().unwrap();
    writeln!(env, "DBSLICE_TEST_URL=postgres://dbslice@127.0.0.1:1/dbslice").unwrap();

    // Nothing listens on port 1, so the health check reaches the connection stage.
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--env",
            env.path().to_str().unwrap(),
            "--output-json",
            "health-check",
        ])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"connected\": false"));
}
