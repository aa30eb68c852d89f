//! Integration tests for the Flashkit CLI
//!
//! These tests verify the CLI behavior without requiring root privileges
//! or actual hardware devices. Writes go to regular files via `--file`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Get a command for the flashkit binary with an isolated config file
#[allow(deprecated)]
fn flashkit(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("flashkit").unwrap();
    cmd.env("FLASHKIT_CONFIG", dir.path().join("flashkit_config.toml"));
    cmd
}

fn image(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

// ============================================================================
// Help and Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("write"))
        .stdout(predicate::str::contains("checksum"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_version_flag() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("flashkit"))
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_no_args_shows_help() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_write_help() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .args(["write", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<SOURCE>"))
        .stdout(predicate::str::contains("<TARGET>"))
        .stdout(predicate::str::contains("--verify"))
        .stdout(predicate::str::contains("--max-run"))
        .stdout(predicate::str::contains("--no-clean"));
}

// ============================================================================
// Write Tests
// ============================================================================

#[test]
fn test_write_to_image_file_pads_last_block() {
    let dir = TempDir::new().unwrap();
    let data = pattern(10_000);
    let source = image(&dir, "source.img", &data);
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args(["write", arg(&source), arg(&target), "--file", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"))
        .stdout(predicate::str::contains("Done."));

    let written = fs::read(&target).unwrap();
    assert_eq!(written.len(), 3 * 4096);
    assert_eq!(&written[..10_000], &data[..]);
    assert!(written[10_000..].iter().all(|&b| b == 0));
}

#[test]
fn test_write_with_verify() {
    let dir = TempDir::new().unwrap();
    let source = image(&dir, "source.img", &pattern(64 * 1024));
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args([
            "write",
            arg(&source),
            arg(&target),
            "--file",
            "--yes",
            "--verify",
            "--checksum",
            "sha256",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Verified"))
        .stdout(predicate::str::contains("SHA-256"));
}

#[test]
fn test_write_silent_prints_nothing() {
    let dir = TempDir::new().unwrap();
    let source = image(&dir, "source.img", &pattern(4096));
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args(["--silent", "write", arg(&source), arg(&target), "--file"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    assert_eq!(fs::read(&target).unwrap().len(), 4096);
}

#[test]
fn test_write_uses_configured_block_size() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("flashkit_config.toml"),
        "[flash]\nblock_size = \"64K\"\n",
    )
    .unwrap();
    let source = image(&dir, "source.img", &pattern(1000));
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args(["--silent", "write", arg(&source), arg(&target), "--file"])
        .assert()
        .success();

    assert_eq!(fs::read(&target).unwrap().len(), 64 * 1024);
}

#[test]
fn test_write_block_size_flag_overrides_config() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("flashkit_config.toml"),
        "[flash]\nblock_size = \"64K\"\n",
    )
    .unwrap();
    let source = image(&dir, "source.img", &pattern(1000));
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args([
            "--silent",
            "write",
            arg(&source),
            arg(&target),
            "--file",
            "--block-size",
            "512",
        ])
        .assert()
        .success();

    assert_eq!(fs::read(&target).unwrap().len(), 1024);
}

#[test]
fn test_write_missing_source() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args([
            "write",
            "/nonexistent/source.img",
            arg(&target),
            "--file",
            "--yes",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open source"));
}

#[test]
fn test_write_invalid_block_size() {
    let dir = TempDir::new().unwrap();
    let source = image(&dir, "source.img", &pattern(4096));
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args([
            "write",
            arg(&source),
            arg(&target),
            "--file",
            "--yes",
            "--block-size",
            "huge",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid block size"));

    assert!(!target.exists());
}

#[test]
fn test_write_invalid_checksum_algorithm() {
    let dir = TempDir::new().unwrap();
    let source = image(&dir, "source.img", &pattern(4096));
    let target = dir.path().join("target.img");

    flashkit(&dir)
        .args([
            "write",
            arg(&source),
            arg(&target),
            "--file",
            "--yes",
            "--checksum",
            "blake3",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid checksum algorithm"));
}

#[test]
fn test_write_verify_flags_conflict() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .args(["write", "a.img", "b.img", "--verify", "--no-verify"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

// ============================================================================
// Checksum Tests
// ============================================================================

#[test]
fn test_checksum_known_vectors() {
    let dir = TempDir::new().unwrap();
    let source = image(&dir, "check.bin", b"123456789");

    for (algorithm, expected) in [
        ("crc32", "cbf43926"),
        (
            "sha256",
            "15e2b0d3c33891ebb0f1ef609ec419420c20e320ce94c65fbc8c3312448eb225",
        ),
    ] {
        flashkit(&dir)
            .args(["--silent", "checksum", arg(&source), "-a", algorithm])
            .assert()
            .success()
            .stdout(format!("{}\n", expected));
    }
}

#[test]
fn test_checksum_default_algorithm_from_config() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("flashkit_config.toml"),
        "[flash]\nchecksum = \"sha256\"\n",
    )
    .unwrap();
    let source = image(&dir, "check.bin", b"123456789");

    flashkit(&dir)
        .args(["checksum", arg(&source)])
        .assert()
        .success()
        .stdout(predicate::str::contains("SHA-256"))
        .stdout(predicate::str::contains(
            "15e2b0d3c33891ebb0f1ef609ec419420c20e320ce94c65fbc8c3312448eb225  check.bin",
        ));
}

#[test]
fn test_checksum_invalid_algorithm() {
    let dir = TempDir::new().unwrap();
    let source = image(&dir, "check.bin", b"123456789");

    flashkit(&dir)
        .args(["checksum", arg(&source), "-a", "blake3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid algorithm"));
}

#[test]
fn test_checksum_missing_file() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .args(["checksum", "/nonexistent/file.img"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open source"));
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_config_path_honors_env() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .args(["config", "--path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("flashkit_config.toml"))
        .stdout(predicate::str::contains(
            dir.path().to_string_lossy().into_owned(),
        ));
}

#[test]
fn test_config_init_then_show() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .args(["config", "--init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created configuration file"));
    assert!(dir.path().join("flashkit_config.toml").exists());

    flashkit(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[flash]"))
        .stdout(predicate::str::contains("max_run = \"128K\""))
        .stdout(predicate::str::contains("not found").not());
}

#[test]
fn test_config_json() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .args(["config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"block_size\": \"4K\""))
        .stdout(predicate::str::contains("\"skip_confirmation\": false"));
}

#[test]
fn test_config_invalid_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("flashkit_config.toml"), "not toml {{{{").unwrap();

    flashkit(&dir)
        .args(["config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"verify\": false"));
}

// ============================================================================
// Completions Tests
// ============================================================================

#[test]
fn test_completions_bash() {
    let dir = TempDir::new().unwrap();
    flashkit(&dir)
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("flashkit"));
}
