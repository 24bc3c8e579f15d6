//! Basic CLI integration tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn imgcat_in(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("imgcat").unwrap();
    cmd.arg("--image-folder")
        .arg(dir)
        .arg("--cache-folder")
        .arg(dir.join("cache"))
        .arg("--hash-length")
        .arg("64");
    cmd
}

#[test]
fn test_help() {
    Command::cargo_bin("imgcat")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("indexes a folder of image sidecars"));
}

#[test]
fn test_version() {
    Command::cargo_bin("imgcat")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("imgcat"));
}

#[test]
fn test_ping_in_process() {
    let dir = tempfile::tempdir().unwrap();
    imgcat_in(dir.path())
        .arg("ping")
        .assert()
        .success()
        .stdout(predicate::str::contains("pong"));
}

#[test]
fn test_find_duplicates_empty_catalog() {
    let dir = tempfile::tempdir().unwrap();
    imgcat_in(dir.path())
        .arg("find-duplicates")
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_get_missing_uid_returns_null() {
    let dir = tempfile::tempdir().unwrap();
    imgcat_in(dir.path())
        .args(["get", "00000000-0000-0000-0000-000000000000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("null"));
}

#[test]
fn test_delete_missing_uid_is_failure() {
    let dir = tempfile::tempdir().unwrap();
    imgcat_in(dir.path())
        .args(["delete", "00000000-0000-0000-0000-000000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no_such_uid"));
}

#[test]
fn test_similar_by_hash_rejects_bad_threshold() {
    let dir = tempfile::tempdir().unwrap();
    imgcat_in(dir.path())
        .args(["similar-by-hash", "00", "--threshold", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("user_error"));
}

#[test]
fn test_similar_by_hash_rejects_wrong_width() {
    let dir = tempfile::tempdir().unwrap();
    // --hash-length 64 allows at most 16 hex digits; this probe supplies 20.
    imgcat_in(dir.path())
        .args(["similar-by-hash", "00000000000000000000"])
        .assert()
        .failure();
}

#[test]
fn test_complete_uid_prefix_empty_catalog() {
    let dir = tempfile::tempdir().unwrap();
    imgcat_in(dir.path())
        .args(["complete-uid-prefix", "a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_update_missing_uid_is_failure() {
    let dir = tempfile::tempdir().unwrap();
    let uid = "11111111-1111-1111-1111-111111111111";
    let record = serde_json::json!({
        "uid": uid,
        "hash": {"bits": 64, "bytes": [1, 2, 3, 4, 5, 6, 7, 8]},
        "caption": "a test caption",
        "authors": null,
        "keywords": [],
        "source": null,
        "group_id": null,
        "collections": [],
        "rating": null,
        "date": "2020-01-01T00:00:00Z",
        "last_updated": "2020-01-01T00:00:00Z",
        "source_other": [],
        "source_via": []
    });
    let record_path = dir.path().join("record.json");
    std::fs::write(&record_path, serde_json::to_string(&record).unwrap()).unwrap();

    imgcat_in(dir.path())
        .args(["update", uid, record_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no_such_uid"));
}
