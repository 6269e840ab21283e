use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

/// Run the binary with HOME and cwd inside `home` so settings, `.env` and the
/// cache never touch the real user directories.
fn expensort(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("expensort").unwrap();
    cmd.current_dir(home)
        .env("HOME", home)
        .env("EXPENSORT_CACHE_DIR", home.join("cache"))
        .env_remove("OPENAI_API_KEY")
        .env_remove("OPENAI_BASE_URL")
        .env_remove("EXPENSORT_LOG");
    cmd
}

fn write_canonical(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("tx.csv");
    std::fs::write(
        &path,
        "id,description,amount,date,merchant,memo\n\
         t1,Coffee,-3.50,2025-01-02,Blue Bottle,\n\
         t2,Lunch,-12.00,2025-01-20,Deli,\n\
         t3,Rent,-900.00,2025-02-01,,\n",
    )
    .unwrap();
    path
}

#[test]
fn test_categorize_without_api_key_fails() {
    let home = tempfile::tempdir().unwrap();
    let csv = write_canonical(home.path());
    expensort(home.path())
        .args(["categorize"])
        .arg(&csv)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error: OPENAI_API_KEY is not set in the environment."));
}

#[test]
fn test_categorize_missing_file_fails() {
    let home = tempfile::tempdir().unwrap();
    expensort(home.path())
        .env("OPENAI_API_KEY", "sk-test")
        .args(["categorize", "does-not-exist.csv"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("CSV file not found"));
}

#[test]
fn test_categorize_header_mismatch_fails() {
    let home = tempfile::tempdir().unwrap();
    let csv = home.path().join("bad.csv");
    std::fs::write(&csv, "Date,Description,Amount\n01/02/2025,Coffee,3.50\n").unwrap();
    expensort(home.path())
        .env("OPENAI_API_KEY", "sk-test")
        .arg("categorize")
        .arg(&csv)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("CSV header mismatch"));
}

#[test]
fn test_partition_requires_a_period() {
    let home = tempfile::tempdir().unwrap();
    let csv = write_canonical(home.path());
    expensort(home.path())
        .arg("partition")
        .arg(&csv)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("partition period"));
}

#[test]
fn test_partition_monthly() {
    let home = tempfile::tempdir().unwrap();
    let csv = write_canonical(home.path());
    expensort(home.path())
        .arg("partition")
        .arg(&csv)
        .args(["--months", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2025-01-02"))
        .stdout(predicate::str::contains("2025-02-02"));
}

#[test]
fn test_init_then_taxonomy_list() {
    let home = tempfile::tempdir().unwrap();
    let data = home.path().join("data");
    expensort(home.path())
        .args(["init", "--data-dir"])
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized expensort"));
    assert!(data.join("expensort.db").exists());

    expensort(home.path())
        .args(["taxonomy", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Groceries"))
        .stdout(predicate::str::contains("Fallback label: Other"));
}
