//! Tests for the `run` subcommand that stop before any network access.

use super::common::run_in;
use tempfile::tempdir;

#[test]
fn test_run_without_api_key_fails() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("missing.toml");

    let (code, _, stderr) = run_in(
        dir.path(),
        &["run", "--config", config.to_str().unwrap(), "-q", "2991576"],
    );

    assert_eq!(code, 1);
    assert!(stderr.contains("Configuration Error"));
    assert!(stderr.contains("api_key"));
}

#[test]
fn test_run_with_non_numeric_query_id_fails() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "[api]\napi_key = \"k\"\n").unwrap();

    let (code, _, stderr) = run_in(
        dir.path(),
        &["run", "--config", config.to_str().unwrap(), "-q", "latest"],
    );

    assert_eq!(code, 1);
    assert!(stderr.contains("must be numeric"));
}

#[test]
fn test_run_rejects_unknown_format() {
    let dir = tempdir().unwrap();

    let (code, _, stderr) = run_in(dir.path(), &["run", "--format", "xml"]);

    assert_eq!(code, 2);
    assert!(stderr.contains("xml"));
}

#[test]
fn test_fatal_error_reaches_terminal_when_logging_to_file() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("missing.toml");
    let log = dir.path().join("logs").join("dune-poll.log");

    let (code, _, stderr) = run_in(
        dir.path(),
        &[
            "run",
            "--config",
            config.to_str().unwrap(),
            "--log-file",
            log.to_str().unwrap(),
            "-q",
            "2991576",
        ],
    );

    assert_eq!(code, 1);
    assert!(stderr.contains("Configuration Error"));
    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(logged.contains("Configuration Error"));
}
