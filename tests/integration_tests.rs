//! CLI-level integration tests.
//!
//! The orchestration scenarios (dispatch-once, recycling, crash rollback,
//! merge taxonomy) are covered with in-memory fakes in the unit tests next
//! to each component; these tests verify the binary surface itself.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a storybot Command with a clean environment so host
/// variables (or a stray .env in cwd) cannot leak into the test.
fn storybot() -> Command {
    let mut cmd = cargo_bin_cmd!("storybot");
    cmd.env_clear();
    cmd
}

#[test]
fn test_help() {
    storybot()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("process"))
        .stdout(predicate::str::contains("merge"))
        .stdout(predicate::str::contains("recover"));
}

#[test]
fn test_version() {
    storybot()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("storybot"));
}

#[test]
fn test_missing_required_env_is_a_contextual_error() {
    let dir = TempDir::new().unwrap();
    storybot()
        .current_dir(dir.path())
        .args(["process", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("STORYBOT_GITHUB_REPO"));
}

#[test]
fn test_malformed_repo_slug_is_rejected() {
    let dir = TempDir::new().unwrap();
    storybot()
        .current_dir(dir.path())
        .env("STORYBOT_GITHUB_REPO", "not-a-slug")
        .env("STORYBOT_GITHUB_TOKEN", "ghp_test")
        .env("STORYBOT_ANTHROPIC_API_KEY", "sk-test")
        .args(["recover"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("owner/repo"));
}

#[test]
fn test_unknown_subcommand_fails() {
    storybot().arg("frobnicate").assert().failure();
}
